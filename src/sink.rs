use crate::telemetry::Sample;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("store request failed: {0}")]
    Transport(String),
    #[error("store rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("store write timed out after {0:?}")]
    Timeout(Duration),
}

/// Destination for drained batches.
///
/// `write_batch` reports failure to the caller; the caller decides what the
/// failed batch costs. Implementations must not retain the batch.
pub trait SampleSink: Send + Sync + 'static {
    fn write_batch(&self, batch: &[Sample]) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Measurement name and descriptive tags attached to every point on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointTags {
    pub measurement: String,
    pub data_source: String,
    pub grid_section: String,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Keeps every batch it is given.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        batches: Mutex<Vec<Vec<Sample>>>,
        written: Notify,
    }

    impl RecordingSink {
        pub(crate) fn batches(&self) -> Vec<Vec<Sample>> {
            self.batches.lock().expect("batches lock").clone()
        }

        pub(crate) fn batch_count(&self) -> usize {
            self.batches.lock().expect("batches lock").len()
        }

        pub(crate) fn sample_count(&self) -> usize {
            self.batches
                .lock()
                .expect("batches lock")
                .iter()
                .map(Vec::len)
                .sum()
        }

        /// Resolves once at least `count` batches have been written.
        pub(crate) async fn wait_for_batches(&self, count: usize) {
            loop {
                let notified = self.written.notified();
                if self.batch_count() >= count {
                    return;
                }
                notified.await;
            }
        }
    }

    impl SampleSink for RecordingSink {
        async fn write_batch(&self, batch: &[Sample]) -> Result<(), SinkError> {
            self.batches
                .lock()
                .expect("batches lock")
                .push(batch.to_vec());
            self.written.notify_waiters();
            Ok(())
        }
    }

    /// Rejects every batch.
    #[derive(Default)]
    pub(crate) struct FailingSink {
        pub(crate) attempts: Mutex<Vec<usize>>,
    }

    impl SampleSink for FailingSink {
        async fn write_batch(&self, batch: &[Sample]) -> Result<(), SinkError> {
            self.attempts.lock().expect("attempts lock").push(batch.len());
            Err(SinkError::Rejected {
                status: 503,
                body: "store unavailable".to_string(),
            })
        }
    }

    /// Never answers.
    pub(crate) struct StalledSink;

    impl SampleSink for StalledSink {
        async fn write_batch(&self, _batch: &[Sample]) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
