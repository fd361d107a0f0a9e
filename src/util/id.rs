use uuid::Uuid;

pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

/// 用量记录 ID。
pub fn record_id() -> String {
    Uuid::new_v4().to_string()
}
