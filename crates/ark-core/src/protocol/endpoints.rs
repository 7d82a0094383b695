//! Endpoint names understood by the remote service.

/// `{user_id}` → `{status, key}`
pub const REGISTER: &str = "register";
/// `{user_id, key}` → `{status, session_id}`
pub const LOGIN: &str = "login";
/// `{user_id, session_id}` → `{status, user_info}`
pub const GET_USER_INFO: &str = "get_user_info";
/// `{}` → `{status, tasks[]}`
pub const GET_DEFAULT_TASKS: &str = "get_default_tasks";
/// Screen frame + task context → `{status, data: {touch_actions[], task_completed}}`
pub const PROCESS_IMAGE: &str = "process_image";
/// `{}` → `{status, data: {version}}`
pub const CHECK_VERSION: &str = "check_version";
