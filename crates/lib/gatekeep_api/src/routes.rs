//! Route paths.

pub const GET_HEALTH: &str = "/health";

pub const POST_USER_LOGIN: &str = "/v1/user/login";
pub const POST_USER_REFRESH_TOKEN: &str = "/v1/user/refresh-token";
pub const POST_USER_LOGOUT: &str = "/v1/user/logout";
pub const POST_USER_LOGOUT_ALL: &str = "/v1/user/logout-all";

pub const POST_USER_REGISTER_SEND_EMAIL_OTP: &str = "/v1/user/register/send-email-otp";
pub const POST_USER_REGISTER_VERIFY_EMAIL_OTP: &str = "/v1/user/register/verify-email-otp";
pub const POST_USER_REGISTER_COMPLETE: &str = "/v1/user/register/complete";

pub const POST_USER_RESTORE_SEND_EMAIL_OTP: &str = "/v1/user/restore/send-email-otp";
pub const POST_USER_RESTORE_VERIFY_EMAIL_OTP: &str = "/v1/user/restore/verify-email-otp";
pub const POST_USER_RESTORE_COMPLETE: &str = "/v1/user/restore/complete";

/// GET, PATCH and DELETE.
pub const USER_ME: &str = "/v1/user/me";
pub const PUT_USER_CHANGE_PASSWORD: &str = "/v1/user/change-password";
