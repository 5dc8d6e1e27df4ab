use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

/// Heartbeat on stderr while a long repair run is walking a tree.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    interval: Duration,
    pub stage: Arc<Mutex<String>>,
    pub files_done: Arc<AtomicUsize>,
    pub files_fixed: Arc<AtomicUsize>,
    pub candidates_tried: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            interval: Duration::from_secs(5),
            stage: Arc::new(Mutex::new(String::new())),
            files_done: Arc::new(AtomicUsize::new(0)),
            files_fixed: Arc::new(AtomicUsize::new(0)),
            candidates_tried: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if self.enabled {
            *self.stage.lock().unwrap() = s.to_string();
        }
    }
    pub fn inc_file(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_fixed(&self) {
        self.files_fixed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_candidate(&self) {
        self.candidates_tried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if !self.enabled || self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(this.interval);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                let s = this.stage.lock().unwrap().clone();
                eprintln!(
                    "[{:>4}s] {} | files {} | fixed {} | candidates {}",
                    t0.elapsed().as_secs(),
                    s,
                    this.files_done.load(Ordering::Relaxed),
                    this.files_fixed.load(Ordering::Relaxed),
                    this.candidates_tried.load(Ordering::Relaxed),
                );
            }
        });
    }
    pub fn stop(&self) {
        if self.enabled {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}
