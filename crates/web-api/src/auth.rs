//! JWT 连接认证
//!
//! 令牌由外部身份服务签发，这里只负责校验；`generate_token` 供本地调试和测试使用。

use axum::http::HeaderMap;
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构，`sub` 为用户 ID
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let now = chrono::Utc::now();
        let exp = now + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            sub: user_id.into(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::unauthorized(format!("token generation failed: {}", err)))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("invalid token: {}", err)))
    }

    pub fn authenticate(&self, token: &str) -> Result<UserId, ApiError> {
        self.verify_token(token).map(|claims| UserId::from(claims.sub))
    }

    /// 从 `Authorization: Bearer` 头中提取并校验用户
    pub fn extract_user_from_headers(&self, headers: &HeaderMap) -> Result<UserId, ApiError> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;

        self.authenticate(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(secret: &str) -> JwtService {
        JwtService::new(JwtConfig {
            secret: secret.to_string(),
            expiration_hours: 1,
        })
    }

    #[test]
    fn issued_token_resolves_to_user() {
        let jwt = service("unit-test-secret-key-with-at-least-32-chars");
        let user_id = UserId::from(Uuid::new_v4());
        let token = jwt.generate_token(user_id).unwrap();

        assert_eq!(jwt.authenticate(&token).unwrap(), user_id);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        assert_eq!(jwt.extract_user_from_headers(&headers).unwrap(), user_id);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let issuer = service("unit-test-secret-key-with-at-least-32-chars");
        let verifier = service("another-secret-key-that-is-also-32-chars");
        let token = issuer.generate_token(UserId::from(Uuid::new_v4())).unwrap();

        let err = verifier.authenticate(&token).unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[test]
    fn missing_bearer_prefix_is_rejected() {
        let jwt = service("unit-test-secret-key-with-at-least-32-chars");
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "token".parse().unwrap());
        assert!(jwt.extract_user_from_headers(&headers).is_err());
    }
}
