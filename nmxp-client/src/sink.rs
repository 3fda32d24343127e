use nmxp_rs_protocol::DataRecord;
use tracing::warn;

/// Errors a record consumer can report.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sink cannot take more records.
    #[error("sink closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Consumer of decoded records (archivers, forwarders, ...).
pub trait RecordSink: Send {
    /// Name used in log messages.
    fn name(&self) -> &str {
        "sink"
    }

    fn process_record(&mut self, record: &DataRecord) -> Result<(), SinkError>;
}

impl<F> RecordSink for F
where
    F: FnMut(&DataRecord) -> Result<(), SinkError> + Send,
{
    fn process_record(&mut self, record: &DataRecord) -> Result<(), SinkError> {
        self(record)
    }
}

/// Fans each record out to every registered sink.
#[derive(Default)]
pub struct RecordPipeline {
    sinks: Vec<Box<dyn RecordSink>>,
}

impl RecordPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: impl RecordSink + 'static) -> &mut Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand `record` to every sink in registration order.
    ///
    /// A failing sink is logged and skipped; the others still run. Returns
    /// the number of sinks that failed.
    pub fn process(&mut self, record: &DataRecord) -> usize {
        let mut failed = 0;
        for sink in &mut self.sinks {
            if let Err(e) = sink.process_record(record) {
                warn!(sink = sink.name(), channel = %record.name(), error = %e, "sink failed");
                failed += 1;
            }
        }
        failed
    }
}

impl std::fmt::Debug for RecordPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordPipeline")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn record() -> DataRecord {
        DataRecord {
            key: 1,
            network: Some("IU".into()),
            station: "ANMO".into(),
            channel: "BHZ".into(),
            packet_type: 1,
            x0: Some(1),
            last_value: Some(3),
            sequence_number: Some(5),
            oldest_sequence: None,
            time: 0.0,
            samples: vec![1, 2],
            sample_rate: 20,
            raw_length: 55,
        }
    }

    struct Collector {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl RecordSink for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn process_record(&mut self, record: &DataRecord) -> Result<(), SinkError> {
            self.seen.lock().unwrap().push(record.key);
            Ok(())
        }
    }

    #[test]
    fn every_sink_sees_every_record() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = RecordPipeline::new();
        pipeline
            .add(Collector { seen: seen.clone() })
            .add(Collector { seen: seen.clone() });

        assert_eq!(pipeline.process(&record()), 0);
        assert_eq!(pipeline.process(&record()), 0);
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn failing_sink_does_not_stop_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = RecordPipeline::new();
        pipeline
            .add(|_: &DataRecord| -> Result<(), SinkError> { Err(SinkError::Closed) })
            .add(Collector { seen: seen.clone() })
            .add(|_: &DataRecord| -> Result<(), SinkError> { Err(SinkError::Other("disk full".into())) });

        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.process(&record()), 2);
        assert_eq!(*seen.lock().unwrap(), [1]);
    }

    #[test]
    fn empty_pipeline() {
        let mut pipeline = RecordPipeline::new();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.process(&record()), 0);
    }
}
