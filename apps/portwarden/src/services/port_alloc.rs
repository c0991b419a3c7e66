use crate::error::PanelError;

/// Picks the lowest port in `[start, end]` not present in `used`.
/// Disabled accounts keep their ports, so `used` must cover every account.
pub fn lowest_free(used: &[i64], start: i64, end: i64) -> Result<i64, PanelError> {
    for port in start..=end {
        if !used.contains(&port) {
            return Ok(port);
        }
    }
    Err(PanelError::PortExhausted { start, end })
}
