use time::format_description::well_known::Rfc3339;

/// Clock used to stamp `now` on every event in a request. Swapped for a
/// fixed clock in tests.
pub trait TimeSource {
    fn current_time(&self) -> String;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        let now = time::OffsetDateTime::now_utc();
        now.format(&Rfc3339)
            .expect("current UTC time formats as RFC 3339")
    }
}
