//! In-order delivery to the downstream pipeline stage.
//!
//! Each `InferContext` owns one [`TransDataHelper`]: a FIFO queue of
//! `(Frame, ResultWaitingCard)` pairs and a dedicated thread draining it.
//! The thread waits on each card before transmitting, which is what makes
//! delivery order match submission order regardless of how cards fulfil
//! out of order across batches inside the engine.

use std::sync::Arc;

use streamforge_core::module::Downstream;

use crate::engine::{ResultWaitingCard, SharedFrame};

struct DeliveryItem {
    frame: SharedFrame,
    card: ResultWaitingCard,
}

/// Per-context delivery helper: submit `(frame, card)` pairs in
/// submission order, they come out the other end (via `downstream`) in
/// that same order.
pub struct TransDataHelper {
    sender: crossbeam_channel::Sender<DeliveryItem>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl TransDataHelper {
    pub fn new(downstream: Arc<dyn Downstream>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<DeliveryItem>();
        let worker = std::thread::Builder::new()
            .name("streamforge-trans-data".into())
            .spawn(move || {
                while let Ok(item) = receiver.recv() {
                    item.card.wait();
                    // By now post-processing (if any) has already dropped
                    // its clone of the Arc, so this is almost always the
                    // sole owner; fall back to a clone if not.
                    let frame = match Arc::try_unwrap(item.frame) {
                        Ok(mutex) => mutex.into_inner(),
                        Err(shared) => shared.lock().clone(),
                    };
                    tracing::debug!(
                        stream_id = %frame.stream_id,
                        frame_id = frame.frame_id,
                        "delivering frame downstream"
                    );
                    downstream.transmit(frame);
                }
            })
            .expect("failed to spawn delivery thread");
        TransDataHelper {
            sender,
            worker: Some(worker),
        }
    }

    pub fn submit(&self, frame: SharedFrame, card: ResultWaitingCard) {
        let _ = self.sender.send(DeliveryItem { frame, card });
    }
}

impl Drop for TransDataHelper {
    fn drop(&mut self) {
        let (dummy, _rx) = crossbeam_channel::unbounded();
        let old = std::mem::replace(&mut self.sender, dummy);
        drop(old);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use streamforge_core::frame::Frame;

    struct RecordingDownstream {
        received: Mutex<Vec<u64>>,
    }

    impl Downstream for RecordingDownstream {
        fn transmit(&self, frame: Frame) {
            self.received.lock().push(frame.frame_id);
        }
    }

    #[test]
    fn delivers_in_submission_order_despite_out_of_order_fulfilment() {
        let downstream = Arc::new(RecordingDownstream {
            received: Mutex::new(Vec::new()),
        });
        let helper = TransDataHelper::new(downstream.clone());

        let cards: Vec<ResultWaitingCard> = (0..5).map(|_| ResultWaitingCard::new()).collect();
        for (i, card) in cards.iter().enumerate() {
            let frame: SharedFrame = Arc::new(Mutex::new(Frame::new("cam0", 0, i as u64)));
            helper.submit(frame, card.clone());
        }

        // Fulfil out of order.
        for i in [4, 2, 0, 3, 1] {
            cards[i].fulfil();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while downstream.received.lock().len() < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(*downstream.received.lock(), vec![0, 1, 2, 3, 4]);
    }
}
