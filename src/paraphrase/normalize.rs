/// Instruction prefixes the model sometimes echoes back, checked in order.
const ECHOED_PREFIXES: [&str; 2] = ["parafrase:", "Parafrase:"];

/// Trims a decoded candidate and drops an echoed instruction prefix.
pub fn clean_candidate(raw: &str) -> String {
    let mut text = raw.trim();
    for prefix in ECHOED_PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim_start();
        }
    }
    text.trim().to_string()
}
