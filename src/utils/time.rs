use chrono::{DateTime, Local};

/// Wall-clock time of this host as `2025-01-31 08:05:09`.
pub fn current_system_time() -> String {
    format_system_time(Local::now())
}

pub fn format_system_time(time: DateTime<Local>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_is_zero_padded() {
        let time = Local.with_ymd_and_hms(2025, 1, 31, 8, 5, 9).unwrap();
        assert_eq!(format_system_time(time), "2025-01-31 08:05:09");
    }

    #[test]
    fn current_time_has_fixed_width() {
        assert_eq!(current_system_time().len(), "2025-01-31 08:05:09".len());
    }
}
