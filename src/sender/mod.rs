pub mod limiter;
pub mod service;
pub mod types;

pub use limiter::SendLimiter;
pub use service::SendService;
pub use types::{dedupe, PriorityClass, Purpose, SendBody, SendErr, SendOk, SendRequest};
