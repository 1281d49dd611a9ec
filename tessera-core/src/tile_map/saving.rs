//! Saving and unloading.
//!
//! A holder leaves the map in two steps. Settlement moves it to the pending unloads; once
//! its save future completes, every piece of work touching the tile has finished and the
//! unload queue saves it and forgets it for good. A holder revived in between simply goes
//! back into the table. The final write is tracked until it lands, so flushing saves wait
//! for it and a reload of the same tile reads it.

use std::sync::Arc;

use super::TileMap;
use crate::{
    storage::TileType,
    task::{CompletableFuture, TaskActor},
    tick::TickContext,
    tile::{TileData, TileHolder, TileStatus},
};

impl TileMap {
    /// Finishes the unload of `holder` once its save future completes.
    pub(super) fn schedule_unload(&self, holder: Arc<TileHolder>) {
        let future = holder.save_future();
        let map = self.this.clone();
        let expected = future.clone();
        future.on_complete_async(self.unload_queue.handle(), move |()| {
            if let Some(map) = map.upgrade() {
                map.finish_unload(holder, &expected);
            }
        });
    }

    fn finish_unload(&self, holder: Arc<TileHolder>, expected: &CompletableFuture<()>) {
        // Work added after the unload was scheduled has to finish as well.
        if !holder.save_future().ptr_eq(expected) {
            self.schedule_unload(holder);
            return;
        }

        let pos = holder.pos();
        let key = pos.key();
        {
            let mut state = self.state.lock();
            let still_pending = state
                .pending_unloads
                .get(&key)
                .is_some_and(|pending| Arc::ptr_eq(pending, &holder));
            if !still_pending {
                return;
            }
            state.pending_unloads.remove(&key);
            state.dirty.remove(&key);
            state.save_cooldowns.remove(&key);
        }
        self.sent.lock().remove(&key);

        if let Some(tile) = holder.latest_tile() {
            tile.pack_ticks(self.current_tick());
            if let Some(write) = self.save_tile(&holder, &tile) {
                let mut state = self.state.lock();
                state.unload_writes.retain(|_, write| !write.is_done());
                state.unload_writes.insert(key, write);
            }
        }
        self.context
            .light
            .remove_tile(pos, self.thresholds.absent_level());
        log::trace!("Unloaded tile {pos}");
    }

    /// Runs up to `limit` queued unloads.
    pub(super) fn process_unloads(&self, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit && self.unload_queue.run_one() {
            processed += 1;
        }
        processed
    }

    /// Submits `tile` to storage if it has unsaved changes. Returns the future of the
    /// write, or `None` if nothing was submitted.
    fn save_tile(&self, holder: &TileHolder, tile: &Arc<TileData>) -> Option<CompletableFuture<()>> {
        let status = tile.status();
        if status == TileStatus::Empty || !tile.is_unsaved() {
            return None;
        }
        let pos = holder.pos();
        // Never replace a complete tile with a partial one.
        if status != TileStatus::Full
            && self.context.type_cache.get(pos) == Some(TileType::Full)
        {
            return None;
        }
        if !tile.take_unsaved() {
            return None;
        }

        let record = tile.to_record(self.current_tick());
        holder.refresh_accessibility();

        let done = CompletableFuture::new();
        let out = done.clone();
        let storage = self.context.storage.clone();
        let type_cache = self.context.type_cache.clone();
        let tile = tile.clone();
        let level = holder.queue_level();
        self.sorter.submit(
            TaskActor::Io,
            pos,
            move || level,
            Box::new(move || {
                match storage.save(pos, record) {
                    Ok(true) => type_cache.set(pos, TileType::of_status(status)),
                    Ok(false) => {}
                    Err(err) => {
                        log::error!("Failed to save tile {pos}: {err}");
                        tile.mark_unsaved();
                    }
                }
                out.complete(());
            }),
        );
        Some(done)
    }

    /// Saves holders that were accessible since their last save, within the autosave limits.
    pub(super) fn autosave(&self, ctx: &TickContext) {
        let tick = ctx.current_tick;
        let cooldown = self.config.autosave.save_cooldown_ticks;
        let candidates: Vec<Arc<TileHolder>> = {
            let state = self.state.lock();
            state
                .holders
                .values()
                .filter(|holder| holder.was_accessible_since_last_save())
                .filter(|holder| {
                    state
                        .save_cooldowns
                        .get(&holder.pos().key())
                        .is_none_or(|last| tick >= last + cooldown)
                })
                .cloned()
                .collect()
        };

        let mut saved = 0;
        for holder in candidates {
            if saved >= self.config.autosave.saves_per_tick || !ctx.has_more_time() {
                break;
            }
            if !holder.save_future().is_done() {
                continue;
            }
            let Some(tile) = holder.latest_tile() else {
                continue;
            };
            self.state
                .lock()
                .save_cooldowns
                .insert(holder.pos().key(), tick);
            if let Some(write) = self.save_tile(&holder, &tile) {
                holder.add_save_dependency(write);
                saved += 1;
            }
        }
        if saved > 0 {
            log::debug!("Autosaved {saved} tiles");
        }
    }

    /// Saves every tile with unsaved changes. With `flush`, also waits for all pending
    /// work and writes, driving the main queue meanwhile.
    ///
    /// Must be called from the main loop.
    pub fn save_all(&self, flush: bool) {
        let span = tracing::info_span!("save_all", flush);
        let _enter = span.enter();

        let mut submitted = 0;
        loop {
            let holders: Vec<Arc<TileHolder>> = {
                let state = self.state.lock();
                state
                    .holders
                    .values()
                    .chain(state.pending_unloads.values())
                    .cloned()
                    .collect()
            };

            let mut waiting: Vec<CompletableFuture<()>> = {
                let mut state = self.state.lock();
                state.unload_writes.retain(|_, write| !write.is_done());
                state.unload_writes.values().cloned().collect()
            };
            for holder in holders {
                if let Some(tile) = holder.latest_tile()
                    && let Some(write) = self.save_tile(&holder, &tile)
                {
                    holder.add_save_dependency(write);
                    submitted += 1;
                }
                let pending = holder.save_future();
                if !pending.is_done() {
                    waiting.push(pending);
                }
            }

            if !flush || waiting.is_empty() {
                break;
            }
            let _ = self.drive_until(&CompletableFuture::join_all(waiting));
        }
        log::info!("Saved {submitted} tiles");
    }
}
