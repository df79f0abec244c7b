//! The append-only tx log.
//!
//! One checksummed record per transaction, in id order. The log keeps the
//! location of every record so `read` is a single backend read.

use crate::codec::{
    decode_record_header, decode_tx, encode_record, encode_tx, verify_record, RECORD_CRC_SIZE,
    RECORD_HEADER_SIZE,
};
use crate::error::{StoreError, StoreResult};
use crate::tx::Tx;
use crate::types::TxId;
use chainkv_storage::StorageBackend;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy)]
struct RecordLocation {
    offset: u64,
    len: usize,
}

pub(crate) struct TxLog {
    backend: Box<dyn StorageBackend>,
    // Index `i` holds the record of `TxId(i + 1)`.
    locations: RwLock<Vec<RecordLocation>>,
}

impl TxLog {
    /// Scans the backend, handing every intact transaction to `on_tx` in
    /// order. A torn final record is truncated away.
    pub(crate) fn recover<F>(backend: Box<dyn StorageBackend>, mut on_tx: F) -> StoreResult<Self>
    where
        F: FnMut(Tx) -> StoreResult<()>,
    {
        let size = backend.size()?;
        let mut offset = 0u64;
        let mut locations = Vec::new();

        while offset < size {
            let remaining = size - offset;
            if remaining < (RECORD_HEADER_SIZE + RECORD_CRC_SIZE) as u64 {
                break;
            }
            let header = backend.read_at(offset, RECORD_HEADER_SIZE)?;
            let payload_len = decode_record_header(&header)?;
            let len = RECORD_HEADER_SIZE + payload_len + RECORD_CRC_SIZE;
            if remaining < len as u64 {
                break;
            }

            let record = backend.read_at(offset, len)?;
            let payload = verify_record(offset, &record)?;
            on_tx(decode_tx(payload)?)?;

            locations.push(RecordLocation { offset, len });
            offset += len as u64;
        }

        if offset < size {
            tracing::warn!(
                offset,
                dropped = size - offset,
                "truncating torn record at end of tx log"
            );
            backend.truncate(offset)?;
            backend.sync()?;
        }

        Ok(Self {
            backend,
            locations: RwLock::new(locations),
        })
    }

    /// Number of records in the log.
    pub(crate) fn len(&self) -> usize {
        self.locations.read().len()
    }

    /// Appends `tx` as the next record.
    ///
    /// The record only becomes readable through [`TxLog::read`] once the
    /// write (and, with `sync`, the flush) succeeded. Any backend failure is
    /// reported as [`StoreError::Durability`]; an oversized payload is
    /// refused before anything is written.
    pub(crate) fn append(&self, tx: &Tx, sync: bool) -> StoreResult<()> {
        let record = encode_record(&encode_tx(tx))?;
        let offset = self
            .backend
            .append(&record)
            .map_err(|e| StoreError::durability(format!("append of {} failed: {e}", tx.id())))?;

        if sync {
            if let Err(e) = self.backend.flush() {
                if let Err(undo) = self.backend.truncate(offset) {
                    tracing::error!(offset, error = %undo, "could not drop unflushed record");
                }
                return Err(StoreError::durability(format!(
                    "flush of {} failed: {e}",
                    tx.id()
                )));
            }
        }

        self.locations.write().push(RecordLocation {
            offset,
            len: record.len(),
        });
        Ok(())
    }

    /// Reads the transaction with the given id.
    pub(crate) fn read(&self, tx_id: TxId) -> StoreResult<Tx> {
        let location = tx_id
            .as_u64()
            .checked_sub(1)
            .and_then(|i| self.locations.read().get(i as usize).copied())
            .ok_or(StoreError::TxNotFound(tx_id))?;

        let record = self.backend.read_at(location.offset, location.len)?;
        let tx = decode_tx(verify_record(location.offset, &record)?)?;
        if tx.id() != tx_id {
            return Err(StoreError::corrupted(format!(
                "record at {} holds {}, expected {tx_id}",
                location.offset,
                tx.id()
            )));
        }
        Ok(tx)
    }

    pub(crate) fn sync(&self) -> StoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Entry;
    use crate::types::ZERO_HASH;
    use chainkv_storage::{FaultSwitch, FaultyBackend, InMemoryBackend};
    use std::sync::Arc;

    fn tx(id: u64) -> Tx {
        Tx::build(TxId(id), id, ZERO_HASH, vec![Entry::new(vec![id as u8], b"v".to_vec())])
    }

    #[test]
    fn records_are_read_back_by_id() {
        let log = TxLog::recover(Box::new(InMemoryBackend::new()), |_| Ok(())).unwrap();
        log.append(&tx(1), true).unwrap();
        log.append(&tx(2), true).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.read(TxId(2)).unwrap(), tx(2));
        assert!(matches!(log.read(TxId(0)), Err(StoreError::TxNotFound(_))));
        assert!(matches!(log.read(TxId(3)), Err(StoreError::TxNotFound(_))));
    }

    #[test]
    fn torn_tail_is_truncated_on_recovery() {
        let backend = Arc::new(InMemoryBackend::new());
        let log = TxLog::recover(Box::new(Arc::clone(&backend)), |_| Ok(())).unwrap();
        log.append(&tx(1), true).unwrap();
        let intact = backend.size().unwrap();
        log.append(&tx(2), true).unwrap();
        drop(log);

        let full = backend.snapshot();
        let torn = Arc::new(InMemoryBackend::with_bytes(full[..full.len() - 3].to_vec()));

        let mut seen = Vec::new();
        let log = TxLog::recover(Box::new(Arc::clone(&torn)), |tx| {
            seen.push(tx.id());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![TxId(1)]);
        assert_eq!(log.len(), 1);
        assert_eq!(torn.size().unwrap(), intact);
    }

    #[test]
    fn failed_flush_leaves_no_record() {
        let switch = FaultSwitch::new();
        let backend = Arc::new(InMemoryBackend::new());
        let faulty = FaultyBackend::new(Arc::clone(&backend), Arc::clone(&switch));
        let log = TxLog::recover(Box::new(faulty), |_| Ok(())).unwrap();

        switch.fail_flush(true);
        let err = log.append(&tx(1), true).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(log.len(), 0);
        assert_eq!(backend.size().unwrap(), 0);
    }

    #[test]
    fn oversized_tx_is_refused_before_writing() {
        let backend = Arc::new(InMemoryBackend::new());
        let log = TxLog::recover(Box::new(Arc::clone(&backend)), |_| Ok(())).unwrap();
        let big = Tx::build(
            TxId(1),
            1,
            ZERO_HASH,
            vec![Entry::new(b"k".to_vec(), vec![0u8; crate::codec::MAX_TX_PAYLOAD_LEN])],
        );

        let err = log.append(&big, true).unwrap_err();
        assert!(matches!(err, StoreError::MaxTxBytesExceeded { .. }));
        assert!(!err.is_fatal());
        assert_eq!(log.len(), 0);
        assert_eq!(backend.size().unwrap(), 0);
    }
}
