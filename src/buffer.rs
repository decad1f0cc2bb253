use crate::telemetry::Sample;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Arrival-ordered holding area shared by the listener and the flush scheduler.
///
/// Every sample handed to [`SampleBuffer::append`] ends up in exactly one
/// batch returned by [`SampleBuffer::drain_all`], or is still buffered.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    samples: Mutex<Vec<Sample>>,
}

impl SampleBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Appends and returns the length after the push.
    pub fn append(&self, sample: Sample) -> usize {
        let mut samples = self.lock();
        samples.push(sample);
        samples.len()
    }

    /// Empties the buffer, returning its former contents in arrival order.
    pub fn drain_all(&self) -> Vec<Sample> {
        let mut samples = self.lock();
        let capacity = samples.capacity();
        std::mem::replace(&mut *samples, Vec::with_capacity(capacity))
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the Vec half-written, so the
    // data behind a poisoned lock is still good.
    fn lock(&self) -> MutexGuard<'_, Vec<Sample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_sample;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn append_reports_new_length() {
        let buffer = SampleBuffer::with_capacity(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.append(test_sample(1)), 1);
        assert_eq!(buffer.append(test_sample(2)), 2);
        assert_eq!(buffer.size(), 2);
    }

    #[test]
    fn drain_all_returns_arrival_order_and_empties() {
        let buffer = SampleBuffer::default();
        for seq in 0..5 {
            buffer.append(test_sample(seq));
        }
        let drained = buffer.drain_all();
        let order: Vec<f64> = drained.iter().map(|s| s.bus_voltage).collect();
        assert_eq!(order, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.size(), 0);
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn concurrent_append_and_drain_neither_lose_nor_duplicate() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 5_000;

        let buffer = Arc::new(SampleBuffer::default());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        buffer.append(test_sample(producer * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        let drainer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..2_000 {
                    seen.extend(buffer.drain_all());
                    thread::yield_now();
                }
                seen
            })
        };

        for producer in producers {
            producer.join().expect("producer thread");
        }
        let mut seen = drainer.join().expect("drainer thread");
        seen.extend(buffer.drain_all());

        assert_eq!(seen.len() as u32, PRODUCERS * PER_PRODUCER);
        let mut ids: Vec<u32> = seen.iter().map(|s| s.bus_voltage as u32).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len() as u32, PRODUCERS * PER_PRODUCER);

        // Per-producer order survives across batches.
        for producer in 0..PRODUCERS {
            let range = producer * PER_PRODUCER..(producer + 1) * PER_PRODUCER;
            let ordered: Vec<u32> = seen
                .iter()
                .map(|s| s.bus_voltage as u32)
                .filter(|id| range.contains(id))
                .collect();
            assert!(ordered.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn survives_a_poisoned_lock() {
        let buffer = Arc::new(SampleBuffer::default());
        buffer.append(test_sample(7));
        let poisoner = buffer.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.samples.lock().expect("lock");
            panic!("poison the buffer");
        })
        .join();

        assert_eq!(buffer.append(test_sample(8)), 2);
        assert_eq!(buffer.drain_all().len(), 2);
    }
}
