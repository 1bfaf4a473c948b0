use uuid::Uuid;

/// Generate an identifier for one tunnel link, used only in logs
pub fn generate_link_id() -> String {
    Uuid::new_v4().to_string()
}
