use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

/// Cookie carrying the refresh token. The name is part of the client
/// contract.
pub const REFRESH_COOKIE_NAME: &str = "refreshToken";

/// Renders refresh tokens into browser cookies. Attributes are fixed:
/// `SameSite=None` + `Secure` because web clients live on a different
/// origin than the API; only the value and max-age vary.
#[derive(Debug, Clone, Copy)]
pub struct CookieFactory {
    max_age: Duration,
}

impl CookieFactory {
    pub fn new(refresh_ttl_secs: i64) -> Self {
        Self {
            max_age: Duration::seconds(refresh_ttl_secs),
        }
    }

    pub fn refresh_cookie(&self, token: &str) -> Cookie<'static> {
        self.build(token.to_string(), self.max_age)
    }

    /// Logout variant: same attributes, dummy value, `Max-Age=0` so the
    /// browser drops the cookie immediately.
    pub fn expiring_cookie(&self) -> Cookie<'static> {
        self.build(String::new(), Duration::ZERO)
    }

    fn build(&self, value: String, max_age: Duration) -> Cookie<'static> {
        Cookie::build((REFRESH_COOKIE_NAME, value))
            .http_only(true)
            .secure(true)
            .same_site(SameSite::None)
            .path("/")
            .max_age(max_age)
            .build()
    }
}
