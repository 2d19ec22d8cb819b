//! Polling event log watcher.
//!
//! Delivers records that appear in a channel after the watcher was primed.
//! A record-id watermark suppresses history and redelivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};

use crate::windows::{EventLogSource, EventQuery, EventRecord};

/// Records fetched per poll
const WATCH_BATCH_SIZE: usize = 100;

pub struct EventLogWatcher {
    source: Arc<dyn EventLogSource>,
    channel: String,
    event_ids: Vec<u32>,
    watermark: Option<u64>,
}

impl EventLogWatcher {
    pub fn new(source: Arc<dyn EventLogSource>, channel: impl Into<String>, event_ids: &[u32]) -> Self {
        Self { source, channel: channel.into(), event_ids: event_ids.to_vec(), watermark: None }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Skip everything currently in the channel.
    ///
    /// A channel that cannot be read stays unprimed and is retried on each
    /// poll.
    pub fn prime(&mut self) -> Result<()> {
        let latest = self.source.latest_record_id(&self.channel)?;
        self.watermark = Some(latest.unwrap_or(0));
        debug!("Watching {} from record {}", self.channel, latest.unwrap_or(0));
        Ok(())
    }

    /// Records newer than the watermark, oldest first.
    pub fn poll(&mut self) -> Result<Vec<EventRecord>> {
        let Some(watermark) = self.watermark else {
            self.prime()?;
            return Ok(Vec::new());
        };

        let query = EventQuery::new(self.channel.as_str(), WATCH_BATCH_SIZE)
            .event_ids(self.event_ids.iter().copied())
            .after_record(watermark)
            .oldest_first();
        let records = self.source.query(&query)?;

        if let Some(max) = records.iter().map(|r| r.record_id).max() {
            self.watermark = Some(max.max(watermark));
        }
        Ok(records)
    }

    /// Poll every `interval` on `runtime` until the receiver goes away.
    pub fn spawn(self, runtime: &Handle, interval: Duration, tx: mpsc::UnboundedSender<EventRecord>) -> JoinHandle<()> {
        let mut watcher = self;
        runtime.spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reported_unavailable = false;

            loop {
                ticker.tick().await;

                let polled = task::spawn_blocking(move || {
                    let result = watcher.poll();
                    (watcher, result)
                })
                .await;
                let (returned, result) = match polled {
                    Ok(polled) => polled,
                    Err(e) => {
                        warn!("Event log watcher task failed: {}", e);
                        return;
                    }
                };
                watcher = returned;

                match result {
                    Ok(records) => {
                        reported_unavailable = false;
                        for record in records {
                            if tx.send(record).is_err() {
                                debug!("Stopping watcher for {}", watcher.channel);
                                return;
                            }
                        }
                    }
                    Err(e) if !reported_unavailable => {
                        info!("Event log {} is not readable, will retry: {:#}", watcher.channel, e);
                        reported_unavailable = true;
                    }
                    Err(e) => debug!("Event log {} still not readable: {:#}", watcher.channel, e),
                }

                if tx.is_closed() {
                    return;
                }
            }
        })
    }
}
