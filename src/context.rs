use chrono::Local;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub source_name: String,
    pub dataset: String,
}

impl RunContext {
    pub fn new(source_name: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            run_id: generate_run_id(),
            source_name: source_name.into(),
            dataset: dataset.into(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Same run, different source.
    pub fn for_source(&self, source_name: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            source_name: source_name.into(),
            dataset: self.dataset.clone(),
        }
    }
}

pub fn generate_run_id() -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let uid = Uuid::new_v4().simple().to_string();
    format!("ingest_{stamp}_{}", &uid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_expected_shape() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "ingest");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
    }

    #[test]
    fn for_source_keeps_run_and_dataset() {
        let ctx = RunContext::new("a", "ds").with_run_id("r1");
        let other = ctx.for_source("b");
        assert_eq!(other.run_id, "r1");
        assert_eq!(other.dataset, "ds");
        assert_eq!(other.source_name, "b");
    }
}
