use actix_web::HttpRequest;
use ring::constant_time;

use crate::utils::errors::GatewayError;

/// Check the `Authorization: Bearer <token>` header against the process
/// admin secret. Comparison is constant-time.
pub fn require_admin(req: &HttpRequest, admin_token: &str) -> Result<(), GatewayError> {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let presented = header.strip_prefix("Bearer ").unwrap_or("");
    if presented.is_empty() {
        return Err(GatewayError::Unauthorized);
    }

    constant_time::verify_slices_are_equal(presented.as_bytes(), admin_token.as_bytes())
        .map_err(|_| GatewayError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn accepts_matching_bearer() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer sekrit"))
            .to_http_request();
        assert!(require_admin(&req, "sekrit").is_ok());
    }

    #[test]
    fn rejects_wrong_or_missing_token() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer wrong"))
            .to_http_request();
        assert_eq!(
            require_admin(&req, "sekrit").unwrap_err().code(),
            "UNAUTHORIZED"
        );

        let req = TestRequest::default().to_http_request();
        assert_eq!(
            require_admin(&req, "sekrit").unwrap_err().code(),
            "UNAUTHORIZED"
        );

        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic sekrit"))
            .to_http_request();
        assert_eq!(
            require_admin(&req, "sekrit").unwrap_err().code(),
            "UNAUTHORIZED"
        );
    }
}
