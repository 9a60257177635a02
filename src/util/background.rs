//! Runner for the node's periodic background workers

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::*;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::select;
use tokio::sync::{mpsc, watch};

use crate::error::Error;

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum WorkerStatus {
	Busy,
	Idle,
	Done,
}

#[async_trait]
pub trait Worker: Send {
	fn name(&self) -> String;

	/// Do one unit of work if available, otherwise return `Idle` immediately.
	/// Errors are logged and the worker is called again after a pause.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error>;

	/// Await until some work becomes available. This future may be
	/// interrupted at any point; waiting on `must_exit` is done by the
	/// runner itself.
	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus;
}

/// Runner driving the node's background workers until the stop
/// signal fires
pub struct BackgroundRunner {
	send_worker: mpsc::UnboundedSender<Box<dyn Worker>>,
}

impl BackgroundRunner {
	pub fn new(stop_signal: watch::Receiver<bool>) -> (Self, tokio::task::JoinHandle<()>) {
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();

		let await_all_done = tokio::spawn(async move {
			run_workers(worker_out, stop_signal).await;
		});

		(Self { send_worker }, await_all_done)
	}

	pub fn spawn_worker<W>(&self, worker: W)
	where
		W: Worker + 'static,
	{
		self.send_worker
			.send(Box::new(worker))
			.ok()
			.expect("Could not put worker in queue");
	}
}

async fn run_workers(
	mut worker_chan: mpsc::UnboundedReceiver<Box<dyn Worker>>,
	stop_signal: watch::Receiver<bool>,
) {
	let mut workers = FuturesUnordered::new();

	while !*stop_signal.borrow() {
		let await_next_worker = async {
			if workers.is_empty() {
				futures::future::pending().await
			} else {
				workers.next().await
			}
		};
		let mut stop_signal_2 = stop_signal.clone();
		select! {
			new_worker_opt = worker_chan.recv() => {
				if let Some(new_worker) = new_worker_opt {
					let stop_signal = stop_signal.clone();
					workers.push(async move {
						let mut handler = WorkerHandler {
							stop_signal,
							worker: new_worker,
							status: WorkerStatus::Busy,
						};
						handler.step().await;
						handler
					}.boxed());
				}
			}
			worker = await_next_worker => {
				if let Some(mut worker) = worker {
					if worker.status == WorkerStatus::Done {
						info!("Worker {} exited", worker.worker.name());
					} else {
						workers.push(async move {
							worker.step().await;
							worker
						}.boxed());
					}
				}
			}
			_ = stop_signal_2.changed() => (),
		}
	}

	// We are exiting, drain everything
	let drain_everything = async move {
		while let Some(worker) = workers.next().await {
			info!("Worker {} exited", worker.worker.name());
		}
	};

	select! {
		_ = drain_everything => {
			info!("All workers exited peacefully");
		}
		_ = tokio::time::sleep(Duration::from_secs(9)) => {
			error!("Some workers could not exit in time, cancelling them");
		}
	}
}

struct WorkerHandler {
	stop_signal: watch::Receiver<bool>,
	worker: Box<dyn Worker>,
	status: WorkerStatus,
}

impl WorkerHandler {
	async fn step(&mut self) {
		match self.status {
			WorkerStatus::Busy => match self.worker.work(&mut self.stop_signal).await {
				Ok(s) => {
					self.status = s;
				}
				Err(e) => {
					error!("Error in worker {}: {}", self.worker.name(), e);
					// Sleep a bit so that the error won't repeat immediately
					tokio::time::sleep(Duration::from_secs(10)).await;
				}
			},
			WorkerStatus::Idle => {
				if *self.stop_signal.borrow() {
					let wait_bounded = Instant::now() + Duration::from_secs(1);
					select! {
						new_st = self.worker.wait_for_work(&self.stop_signal) => {
							self.status = new_st;
						}
						_ = tokio::time::sleep_until(wait_bounded.into()) => (),
					}
				} else {
					let stop_signal_worker = self.stop_signal.clone();
					let mut stop_signal = self.stop_signal.clone();
					select! {
						new_st = self.worker.wait_for_work(&stop_signal_worker) => {
							self.status = new_st;
						}
						_ = stop_signal.changed() => (),
					}
				}
			}
			WorkerStatus::Done => unreachable!(),
		}
	}
}
