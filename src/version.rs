use chrono::{DateTime, Local};

fn build_datetime() -> DateTime<Local> {
    let build_timestamp: i64 = env!("BUILD_TIME").parse().unwrap_or(0);
    DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now)
}

pub fn get_version_info() -> &'static str {
    let build_time_str = build_datetime().format("%Y-%m-%d %H:%M:%S %Z").to_string();
    Box::leak(
        format!(
            "webphone {}\n\
         Build Time: {}\n\
         Git Commit: {}\n\
         Git Branch: {}\n\
         Git Status: {}",
            env!("CARGO_PKG_VERSION"),
            build_time_str,
            env!("GIT_COMMIT_HASH"),
            env!("GIT_BRANCH"),
            env!("GIT_DIRTY")
        )
        .into_boxed_str(),
    )
}

/// Sent as the HTTP user agent and as the sdk version on registration.
pub fn get_useragent() -> String {
    format!(
        "webphone/{} (built {})",
        env!("CARGO_PKG_VERSION"),
        build_datetime().format("%Y-%m-%d")
    )
}
