// src/store/batch.rs

//! Batch create / update / delete
//!
//! Inputs are grouped into sub-batches of the configured batch size; each
//! sub-batch runs under its own transaction. A failing item rolls its
//! whole sub-batch back while later sub-batches still run, and the
//! per-item causes are aggregated into one `BatchFailed` error at the
//! end. Within one sub-batch every created row shares a single ledger
//! allocation.

use tracing::{debug, warn};

use crate::entity::{Entity, OpContext};
use crate::error::{BatchItemError, Error, Result};
use crate::version;

use super::EntityStore;
use super::crud::DeleteEffect;

impl<T: Entity> EntityStore<'_, T> {
    /// Create many entities in sub-batches
    pub fn create_batch(&self, entities: &[T], ctx: &OpContext) -> Result<Vec<T>> {
        let batch_size = self.store().config().batch_size.max(1);
        let mut created = Vec::with_capacity(entities.len());
        let mut failures: Vec<BatchItemError> = Vec::new();

        for (chunk_index, chunk) in entities.chunks(batch_size).enumerate() {
            ctx.cancel.check()?;
            let base_index = chunk_index * batch_size;

            let conn = self.store().connection()?;
            let tx = self.store().begin_write(&conn)?;

            // One allocation serves every create in this sub-batch
            let shared_version = if self.schema.flags.soft_delete {
                Some(version::allocate(&tx)?)
            } else {
                None
            };

            let mut chunk_created = Vec::with_capacity(chunk.len());
            let mut chunk_failure = None;
            for (offset, entity) in chunk.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match self.create_in_tx(&tx, entity, shared_version) {
                    Ok(stored) => chunk_created.push(stored),
                    Err(err) => {
                        chunk_failure = Some(BatchItemError {
                            index: base_index + offset,
                            key: entity.key(),
                            cause: err.to_string(),
                        });
                        break;
                    }
                }
            }

            match chunk_failure {
                Some(failure) => {
                    drop(tx);
                    warn!(
                        entity = T::entity_type(),
                        index = failure.index,
                        cause = %failure.cause,
                        "batch create sub-batch rolled back"
                    );
                    failures.push(failure);
                }
                None => {
                    tx.commit()?;
                    for stored in &chunk_created {
                        self.audit_write(
                            "CREATE",
                            &stored.key(),
                            None,
                            Some(stored.version()),
                            None,
                            Some(stored),
                            ctx,
                        );
                    }
                    created.append(&mut chunk_created);
                }
            }
        }

        if failures.is_empty() {
            debug!(
                entity = T::entity_type(),
                count = created.len(),
                "batch create complete"
            );
            Ok(created)
        } else {
            Err(Error::BatchFailed { failures })
        }
    }

    /// Update many entities in sub-batches under optimistic concurrency
    pub fn update_batch(&self, entities: &[T], ctx: &OpContext) -> Result<Vec<T>> {
        let batch_size = self.store().config().batch_size.max(1);
        let mut updated = Vec::with_capacity(entities.len());
        let mut failures: Vec<BatchItemError> = Vec::new();

        for (chunk_index, chunk) in entities.chunks(batch_size).enumerate() {
            ctx.cancel.check()?;
            let base_index = chunk_index * batch_size;

            let conn = self.store().connection()?;
            let tx = self.store().begin_write(&conn)?;

            let mut chunk_updated: Vec<(T, T)> = Vec::with_capacity(chunk.len());
            let mut chunk_failure = None;
            for (offset, entity) in chunk.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let outcome: Result<(T, T)> = (|| {
                    let head = self
                        .read_head(&tx, &entity.key())?
                        .filter(|h| self.is_live(h))
                        .ok_or_else(|| Error::NotFound(entity.key()))?;
                    if head.version() != entity.version() {
                        return Err(Error::ConcurrencyConflict {
                            key: entity.key(),
                            expected: entity.version(),
                            actual: head.version(),
                        });
                    }
                    let stored = self.update_in_tx(&tx, entity, &head, None)?;
                    Ok((head, stored))
                })();
                match outcome {
                    Ok(pair) => chunk_updated.push(pair),
                    Err(err) => {
                        chunk_failure = Some(BatchItemError {
                            index: base_index + offset,
                            key: entity.key(),
                            cause: err.to_string(),
                        });
                        break;
                    }
                }
            }

            match chunk_failure {
                Some(failure) => {
                    drop(tx);
                    warn!(
                        entity = T::entity_type(),
                        index = failure.index,
                        cause = %failure.cause,
                        "batch update sub-batch rolled back"
                    );
                    failures.push(failure);
                }
                None => {
                    tx.commit()?;
                    for (head, stored) in &chunk_updated {
                        self.audit_write(
                            "UPDATE",
                            &stored.key(),
                            Some(head.version()),
                            Some(stored.version()),
                            Some(head),
                            Some(stored),
                            ctx,
                        );
                    }
                    updated.extend(chunk_updated.into_iter().map(|(_, stored)| stored));
                }
            }
        }

        if failures.is_empty() {
            Ok(updated)
        } else {
            Err(Error::BatchFailed { failures })
        }
    }

    /// Delete many keys in sub-batches; returns the number of effective
    /// deletes (idempotent no-ops are not counted)
    pub fn delete_batch(&self, keys: &[String], ctx: &OpContext) -> Result<usize> {
        let batch_size = self.store().config().batch_size.max(1);
        let mut effective = 0usize;
        let mut failures: Vec<BatchItemError> = Vec::new();

        for (chunk_index, chunk) in keys.chunks(batch_size).enumerate() {
            ctx.cancel.check()?;
            let base_index = chunk_index * batch_size;

            let conn = self.store().connection()?;
            let tx = self.store().begin_write(&conn)?;

            let mut chunk_effects: Vec<(String, DeleteEffect)> = Vec::new();
            let mut chunk_failure = None;
            for (offset, key) in chunk.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match self.delete_in_tx(&tx, key, None) {
                    Ok(effect) => chunk_effects.push((key.clone(), effect)),
                    Err(err) => {
                        chunk_failure = Some(BatchItemError {
                            index: base_index + offset,
                            key: key.clone(),
                            cause: err.to_string(),
                        });
                        break;
                    }
                }
            }

            match chunk_failure {
                Some(failure) => {
                    drop(tx);
                    warn!(
                        entity = T::entity_type(),
                        index = failure.index,
                        cause = %failure.cause,
                        "batch delete sub-batch rolled back"
                    );
                    failures.push(failure);
                }
                None => {
                    tx.commit()?;
                    for (key, effect) in &chunk_effects {
                        if let DeleteEffect::Applied {
                            old_version,
                            new_version,
                        } = effect
                        {
                            effective += 1;
                            self.audit_write(
                                "DELETE",
                                key,
                                *old_version,
                                *new_version,
                                None,
                                None,
                                ctx,
                            );
                        }
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(effective)
        } else {
            Err(Error::BatchFailed { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{Order, test_store};

    fn orders(n: usize) -> Vec<Order> {
        (0..n)
            .map(|i| Order::new(&format!("k{i}"), &format!("ORD-{i}"), "New", i as f64))
            .collect()
    }

    #[test]
    fn test_batch_create_shares_one_version_per_sub_batch() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();

        let created = handle.create_batch(&orders(5), &OpContext::new()).unwrap();
        assert_eq!(created.len(), 5);
        let first_version = created[0].version;
        assert!(created.iter().all(|o| o.version == first_version));
    }

    #[test]
    fn test_batch_create_failure_rolls_back_whole_sub_batch() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        // Pre-existing key makes the middle item collide
        handle
            .create(&Order::new("k1", "ORD-X", "New", 0.0), &ctx)
            .unwrap();

        let result = handle.create_batch(&orders(3), &ctx);
        let Err(Error::BatchFailed { failures }) = result else {
            panic!("expected aggregate failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "k1");
        assert_eq!(failures[0].index, 1);

        // k0 was in the failing sub-batch, so it rolled back too
        assert!(handle.get("k0", &ctx).unwrap().is_none());
        assert!(handle.get("k1", &ctx).unwrap().is_some());
    }

    #[test]
    fn test_batch_update_and_delete() {
        let (_dir, store) = test_store();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        let mut created = handle.create_batch(&orders(4), &ctx).unwrap();
        for order in &mut created {
            order.status = "Processing".to_string();
        }
        let updated = handle.update_batch(&created, &ctx).unwrap();
        assert_eq!(updated.len(), 4);
        assert!(updated.iter().all(|o| o.status == "Processing"));

        let keys: Vec<String> = updated.iter().map(|o| o.id.clone()).collect();
        let deleted = handle.delete_batch(&keys, &ctx).unwrap();
        assert_eq!(deleted, 4);

        // Second round is a no-op
        let deleted_again = handle.delete_batch(&keys, &ctx).unwrap();
        assert_eq!(deleted_again, 0);
    }

    #[test]
    fn test_later_sub_batches_run_after_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::store::StoreConfig {
            batch_size: 2,
            ..Default::default()
        };
        let store = crate::store::Store::open(dir.path().join("s.db"), config).unwrap();
        let handle = store.entity::<Order>().unwrap();
        let ctx = OpContext::new();

        // Collides with the first sub-batch only
        handle
            .create(&Order::new("k0", "ORD-X", "New", 0.0), &ctx)
            .unwrap();

        let result = handle.create_batch(&orders(4), &ctx);
        assert!(matches!(result, Err(Error::BatchFailed { .. })));

        // Sub-batch [k2, k3] still committed
        assert!(handle.get("k2", &ctx).unwrap().is_some());
        assert!(handle.get("k3", &ctx).unwrap().is_some());
        // Sub-batch [k0, k1] rolled back
        assert!(handle.get("k1", &ctx).unwrap().is_none());
    }
}
