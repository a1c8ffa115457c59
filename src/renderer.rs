//! Rendering: the proof-of-work search loop. Each worker owns a candidate
//! view and advances independently; the processor serializes submissions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::consideration::{now_unix, Consideration, PublicKey};
use crate::consideration_queue::ConsiderationQueue;
use crate::constants::{MAX_CONSIDERATIONS_TO_INCLUDE_PER_VIEW, MAX_NUMBER};
use crate::error::ProcessError;
use crate::ledger::Ledger;
use crate::processor::{get_point_tip_header, is_initial_view_download, Processor};
use crate::retarget::{compute_median_timestamp, compute_target};
use crate::view::{View, ViewHeader, ViewID};
use crate::view_header_hasher::ViewHeaderHasher;
use crate::view_storage::ViewStorage;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Tries to render a new tip view on a dedicated worker thread.
pub struct Renderer {
    num: usize,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

struct Worker {
    /// Champions of any view(-point) we render.
    pub_keys: Vec<PublicKey>,
    /// Memo field of any viewpoint we render.
    memo: String,
    view_store: Arc<dyn ViewStorage>,
    cn_queue: Arc<dyn ConsiderationQueue>,
    ledger: Arc<dyn Ledger>,
    processor: Processor,
    num: usize,
    hash_update_tx: std_mpsc::Sender<i64>,
    shutdown: Arc<AtomicBool>,
}

impl Renderer {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        pub_keys: Vec<PublicKey>,
        memo: String,
        view_store: Arc<dyn ViewStorage>,
        cn_queue: Arc<dyn ConsiderationQueue>,
        ledger: Arc<dyn Ledger>,
        processor: Processor,
        hash_update_tx: std_mpsc::Sender<i64>,
        num: usize,
    ) -> Renderer {
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            pub_keys,
            memo,
            view_store,
            cn_queue,
            ledger,
            processor,
            num,
            hash_update_tx,
            shutdown: shutdown.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("renderer-{}", num))
            .spawn(move || worker.run())
            .expect("spawn renderer thread");
        Renderer {
            num,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stops the renderer synchronously.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!(renderer = self.num, "renderer shutdown");
    }
}

impl Worker {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn run(&self) {
        // don't start rendering until we think we're synced; we'd just
        // waste attempts on a stale tip
        let mut last_check = None;
        loop {
            if self.stopping() {
                return;
            }
            let due = last_check
                .map(|at: Instant| at.elapsed() >= TICK_INTERVAL)
                .unwrap_or(true);
            if due {
                match is_initial_view_download(self.ledger.as_ref(), self.view_store.as_ref()) {
                    Ok((false, _)) => break,
                    Ok((true, _)) => {
                        debug!(renderer = self.num, "waiting for focal point sync");
                        last_check = Some(Instant::now());
                    }
                    Err(err) => {
                        error!(renderer = self.num, error = %err, "renderer cannot read the tip");
                        return;
                    }
                }
            }
            thread::sleep(Duration::from_millis(250));
        }

        let (tip_sub, mut tip_rx) = match self.processor.register_for_tip_changes_blocking() {
            Ok(sub) => sub,
            Err(_) => return,
        };
        let (new_tx_sub, mut new_tx_rx) =
            match self.processor.register_for_new_considerations_blocking() {
                Ok(sub) => sub,
                Err(_) => return,
            };

        let mut rng = rand::thread_rng();
        let mut key_index = rng.gen_range(0..self.pub_keys.len());
        let mut hasher = ViewHeaderHasher::new();
        let mut hashes: i64 = 0;
        let mut median_timestamp: i64 = 0;
        let mut current: Option<(View, ViewID)> = None;
        let mut last_tick = Instant::now();

        // main rendering loop
        loop {
            if self.stopping() {
                break;
            }

            match tip_rx.try_recv() {
                Ok(tip) => {
                    if !tip.connect || tip.more {
                        // only build off newly connected tip views
                        continue;
                    }
                    debug!(renderer = self.num, tip = %tip.view_id, "building off new tip view");
                    // give up whatever view we were working on
                    current = self.next_candidate(
                        &tip.view_id,
                        &tip.view.header,
                        key_index,
                        &mut median_timestamp,
                        &mut hasher,
                    );
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            match new_tx_rx.try_recv() {
                Ok(new_tx) => {
                    let Some((view, _)) = current.as_mut() else {
                        // we're not working on a view yet
                        continue;
                    };
                    if view.considerations.len() >= MAX_CONSIDERATIONS_TO_INCLUDE_PER_VIEW {
                        debug!(
                            renderer = self.num,
                            count = view.considerations.len(),
                            "per-view consideration limit hit"
                        );
                        continue;
                    }
                    if let Err(err) =
                        view.add_consideration(new_tx.consideration_id, new_tx.consideration)
                    {
                        warn!(
                            renderer = self.num,
                            consideration_id = %new_tx.consideration_id,
                            error = %err,
                            "error adding new consideration to view"
                        );
                        // abandon the view
                        current = None;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                last_tick = Instant::now();

                // update the hash count for the hashrate monitor
                let _ = self.hash_update_tx.send(hashes);
                hashes = 0;

                // refresh the view time every so often
                if let Some((view, _)) = current.as_mut() {
                    let now = now_unix();
                    if now > median_timestamp {
                        view.header.time = now;
                    }
                }
            }

            if current.is_none() {
                // find the tip to start working off of
                let tip = match get_point_tip_header(self.ledger.as_ref(), self.view_store.as_ref())
                {
                    Ok(Some(tip)) => tip,
                    Ok(None) => {
                        thread::sleep(Duration::from_millis(250));
                        continue;
                    }
                    Err(err) => {
                        error!(renderer = self.num, error = %err, "renderer cannot read the tip");
                        break;
                    }
                };
                current = self.next_candidate(
                    &tip.0,
                    &tip.1,
                    key_index,
                    &mut median_timestamp,
                    &mut hasher,
                );
                if current.is_none() {
                    break;
                }
            }

            // hash the view and check the proof-of-work
            let (view, target) = current.as_mut().expect("candidate view");
            let (id, attempts) = hasher.update(&view.header);
            hashes += attempts;
            if id <= *target {
                // found a solution
                info!(renderer = self.num, view_id = %id, "rendered new view");
                let (view, _) = current.take().expect("candidate view");
                if let Err(err) = self.processor.process_view_blocking(id, view, "localhost") {
                    warn!(renderer = self.num, error = %err, "error processing rendered view");
                }
                key_index = rng.gen_range(0..self.pub_keys.len());
                hasher.reset();
            } else {
                // no solution yet
                view.header.nonce += attempts;
                if view.header.nonce > MAX_NUMBER {
                    view.header.nonce = 0;
                }
            }
        }

        self.processor.unregister_for_tip_changes(tip_sub);
        self.processor.unregister_for_new_considerations(new_tx_sub);
        debug!(renderer = self.num, "renderer loop exited");
    }

    /// Build the next candidate view off the given tip, clamp its time above
    /// the median, and reset the incremental hasher for the new buffer.
    fn next_candidate(
        &self,
        tip_id: &ViewID,
        tip_header: &ViewHeader,
        key_index: usize,
        median_timestamp: &mut i64,
        hasher: &mut ViewHeaderHasher,
    ) -> Option<(View, ViewID)> {
        let pub_key = self.pub_keys[key_index];
        let mut view = match create_next_view(
            tip_id,
            tip_header,
            self.cn_queue.as_ref(),
            self.view_store.as_ref(),
            self.ledger.as_ref(),
            pub_key,
            &self.memo,
        ) {
            Ok(view) => view,
            Err(err) => {
                error!(renderer = self.num, error = %err, "error creating next view");
                return None;
            }
        };

        // make sure we're at least one past the median timestamp
        *median_timestamp =
            match compute_median_timestamp(tip_header, self.view_store.as_ref()) {
                Ok(median) => median,
                Err(err) => {
                    error!(renderer = self.num, error = %err, "error computing median timestamp");
                    return None;
                }
            };
        if view.header.time <= *median_timestamp {
            view.header.time = *median_timestamp + 1;
        }

        hasher.reset();
        let target = view.header.target;
        Some((view, target))
    }
}

/// Create a new view off of the given tip. Called by the renderer and to
/// satisfy peer work requests.
pub fn create_next_view(
    tip_id: &ViewID,
    tip_header: &ViewHeader,
    cn_queue: &dyn ConsiderationQueue,
    view_store: &dyn ViewStorage,
    ledger: &dyn Ledger,
    pub_key: PublicKey,
    memo: &str,
) -> Result<View, ProcessError> {
    // fetch considerations to confirm from the queue
    let mut cns = cn_queue.get(MAX_CONSIDERATIONS_TO_INCLUDE_PER_VIEW - 1);

    let new_height = tip_header.height + 1;

    // prepend the viewpoint
    let viewpoint = Consideration::new(None, pub_key, 0, 0, new_height, memo);
    cns.insert(0, viewpoint);

    // compute the next target
    let new_target = compute_target(tip_header, view_store, ledger)?;

    View::new(*tip_id, new_height, new_target, tip_header.point_work, cns)
}

/// Collects hash counts from all renderers in order to monitor and display
/// the aggregate hashrate.
pub struct HashrateMonitor {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HashrateMonitor {
    pub fn spawn(hash_update_rx: std_mpsc::Receiver<i64>) -> HashrateMonitor {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::Builder::new()
            .name("hashrate-monitor".to_owned())
            .spawn(move || {
                const UPDATE_INTERVAL: Duration = Duration::from_secs(60);
                let mut total_hashes: i64 = 0;
                let mut last_update = Instant::now();
                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match hash_update_rx.recv_timeout(Duration::from_secs(1)) {
                        Ok(hashes) => total_hashes += hashes,
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                    if last_update.elapsed() >= UPDATE_INTERVAL {
                        let hps = total_hashes as f64 / last_update.elapsed().as_secs_f64();
                        info!("hashrate: {:.2} MH/s", hps / 1000.0 / 1000.0);
                        total_hashes = 0;
                        last_update = Instant::now();
                    }
                }
            })
            .expect("spawn hashrate monitor thread");
        HashrateMonitor {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stops the monitor synchronously.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("hashrate monitor shutdown");
    }
}
