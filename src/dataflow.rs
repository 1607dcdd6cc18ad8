//! Channel primitives for the operator layer.
//!
//! Unbounded FIFO channels carry [`Message`]s between operators; a
//! [`Message::PoisonPill`] (or channel closure) marks end-of-stream.
//! Singleton sources model bound value channels: they re-emit their value on
//! every firing and never close. [`DataflowVariable`] is the one-shot
//! broadcast used for shared outputs.

use tokio::sync::{mpsc, watch};

use crate::value::DataValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Item(DataValue),
    PoisonPill,
}

pub type Sender = mpsc::UnboundedSender<Message>;
pub type Receiver = mpsc::UnboundedReceiver<Message>;

pub fn channel() -> (Sender, Receiver) {
    mpsc::unbounded_channel()
}

/// Send a value downstream, ignoring detached readers.
pub fn bind(tx: &Sender, value: DataValue) {
    let _ = tx.send(Message::Item(value));
}

/// Signal end-of-stream downstream.
pub fn close(tx: &Sender) {
    let _ = tx.send(Message::PoisonPill);
}

/// What one read from an input port produced.
#[derive(Debug)]
pub enum Read {
    Item(DataValue),
    Pill,
}

/// One input port of an operator.
pub enum InputSource {
    /// A draining FIFO; exhaustion or a pill ends the stream.
    Queue(Receiver),
    /// A bound value, re-read on every firing; never closes.
    Singleton(DataValue),
}

impl InputSource {
    pub async fn read(&mut self) -> Read {
        match self {
            InputSource::Queue(rx) => match rx.recv().await {
                Some(Message::Item(value)) => Read::Item(value),
                Some(Message::PoisonPill) | None => Read::Pill,
            },
            InputSource::Singleton(value) => Read::Item(value.clone()),
        }
    }

    pub fn is_singleton(&self) -> bool {
        matches!(self, InputSource::Singleton(_))
    }
}

/// Read one value per port to form a firing tuple. `None` means a pill
/// arrived on some port and the operator should stop.
pub async fn read_tuple(sources: &mut [InputSource]) -> Option<Vec<DataValue>> {
    let mut tuple = Vec::with_capacity(sources.len());
    for source in sources.iter_mut() {
        match source.read().await {
            Read::Item(value) => tuple.push(value),
            Read::Pill => return None,
        }
    }
    Some(tuple)
}

/// One-shot broadcast variable: bound at most once, read many times.
#[derive(Clone)]
pub struct DataflowVariable {
    tx: watch::Sender<Option<DataValue>>,
}

impl DataflowVariable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Bind the value. The first bind wins; later binds are no-ops.
    pub fn bind(&self, value: DataValue) -> bool {
        let mut bound = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value.clone());
                bound = true;
                true
            } else {
                false
            }
        });
        bound
    }

    pub fn get(&self) -> Option<DataValue> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> DataValue {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                // Writer dropped without binding; treat as null.
                return DataValue::Null;
            }
        }
    }
}

impl Default for DataflowVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_reads_until_pill() {
        let (tx, rx) = channel();
        bind(&tx, DataValue::Int(1));
        close(&tx);
        let mut source = InputSource::Queue(rx);
        assert!(matches!(source.read().await, Read::Item(DataValue::Int(1))));
        assert!(matches!(source.read().await, Read::Pill));
    }

    #[tokio::test]
    async fn closed_channel_reads_as_pill() {
        let (tx, rx) = channel();
        drop(tx);
        let mut source = InputSource::Queue(rx);
        assert!(matches!(source.read().await, Read::Pill));
    }

    #[tokio::test]
    async fn singleton_re_emits() {
        let mut source = InputSource::Singleton(DataValue::Int(9));
        for _ in 0..3 {
            assert!(matches!(source.read().await, Read::Item(DataValue::Int(9))));
        }
    }

    #[tokio::test]
    async fn variable_binds_once() {
        let var = DataflowVariable::new();
        assert!(var.bind(DataValue::Int(1)));
        assert!(!var.bind(DataValue::Int(2)));
        assert_eq!(var.get(), Some(DataValue::Int(1)));
        assert_eq!(var.wait().await, DataValue::Int(1));
    }
}
