//! Background inference on a shared engine.
//!
//! A worker thread repeatedly runs one kernel against the engine until it is
//! told to stop. The engine stays behind a mutex, so the foreground can read
//! values between sweeps; each sweep's [`InferReport`] is sent back over a
//! channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;

use crate::engine::driver::{Engine, InferReport, KernelSpec};
use crate::engine::errors::ExecError;

pub struct ContinuousInference {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<(), ExecError>>>,
    reports: Receiver<InferReport>,
}

impl ContinuousInference {
    /// Makes the engine consistent, then starts sweeping `spec` on a new
    /// thread.
    pub fn start(engine: Arc<Mutex<Engine>>, spec: KernelSpec) -> Result<Self, ExecError> {
        engine.lock().make_consistent()?;

        let running = Arc::new(AtomicBool::new(true));
        let (sender, reports) = unbounded();
        let flag = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("torus-continuous".into())
            .spawn(move || {
                #[cfg(feature = "tracing")]
                tracing::debug!(?spec, "continuous inference started");
                while flag.load(Ordering::Acquire) {
                    let report = engine.lock().infer(&spec);
                    let report = match report {
                        Ok(report) => report,
                        Err(err) => {
                            flag.store(false, Ordering::Release);
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %err, "continuous inference stopped");
                            return Err(err);
                        }
                    };
                    if sender.send(report).is_err() {
                        break;
                    }
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("continuous inference finished");
                Ok(())
            })
            .map_err(|e| ExecError::Internal(format!("failed to spawn inference thread: {}", e)))?;

        Ok(Self {
            running,
            worker: Some(worker),
            reports,
        })
    }

    /// True until [`ContinuousInference::stop`] is called or a sweep fails.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reports of the sweeps completed since the last call.
    pub fn drain_reports(&self) -> InferReport {
        let mut total = InferReport::default();
        for report in self.reports.try_iter() {
            total.merge(report);
        }
        total
    }

    /// Blocks until the worker has finished its current sweep and exited.
    /// Returns the reports not yet drained, or the error that stopped the
    /// worker.
    pub fn stop(mut self) -> Result<InferReport, ExecError> {
        self.running.store(false, Ordering::Release);
        let outcome = match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| ExecError::Internal("inference thread panicked".into()))?,
            None => Ok(()),
        };
        outcome?;
        Ok(self.drain_reports())
    }
}

impl Drop for ContinuousInference {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_until_stopped() {
        let mut engine = Engine::with_seed(4);
        engine.assume("x", "(normal 0 1)").unwrap();
        engine.observe("(normal x 1)", 1.0).unwrap();
        let engine = Arc::new(Mutex::new(engine));

        let spec = KernelSpec::parse("(mh default one 1)").unwrap();
        let inference = ContinuousInference::start(Arc::clone(&engine), spec).unwrap();
        assert!(inference.is_running());
        assert_eq!(engine.lock().num_unconstrained_choices(), 1);
        let first = loop {
            let report = inference.drain_reports();
            if report.transitions > 0 {
                break report;
            }
            std::thread::yield_now();
        };
        let rest = inference.stop().unwrap();
        assert!(first.transitions + rest.transitions >= 1);
        assert!(engine.lock().is_consistent());
    }
}
