use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub source_id: String,
    pub ra: f64,
    pub dec: f64,
    pub allwise_cntr: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(source_id: impl Into<String>, ra: f64, dec: f64, allwise_cntr: Option<i64>) -> Source {
        Source {
            source_id: source_id.into(),
            ra,
            dec,
            allwise_cntr,
            created_at: Utc::now(),
        }
    }
}
