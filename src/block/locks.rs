use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// In-process lock table keyed by canonical data block path, complementing
/// the cross-process advisory file locks. Shared holders are reference
/// counted; an exclusive holder excludes everyone else.
#[derive(Default)]
pub struct BlockLocks {
	states: Mutex<HashMap<PathBuf, LockState>>,
	cond: Condvar,
}

#[derive(Clone, Copy)]
struct LockState {
	exclusive: bool,
	holders: usize,
}

impl BlockLocks {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn lock_shared(&self, path: &Path) {
		let mut states = self.states.lock().unwrap();
		loop {
			match states.get_mut(path) {
				None => {
					states.insert(
						path.to_path_buf(),
						LockState {
							exclusive: false,
							holders: 1,
						},
					);
					return;
				}
				Some(state) if !state.exclusive => {
					state.holders += 1;
					return;
				}
				Some(_) => {
					states = self.cond.wait(states).unwrap();
				}
			}
		}
	}

	pub fn lock_exclusive(&self, path: &Path) {
		let mut states = self.states.lock().unwrap();
		while states.contains_key(path) {
			states = self.cond.wait(states).unwrap();
		}
		states.insert(
			path.to_path_buf(),
			LockState {
				exclusive: true,
				holders: 1,
			},
		);
	}

	pub fn unlock(&self, path: &Path) {
		let mut states = self.states.lock().unwrap();
		if let Some(state) = states.get_mut(path) {
			state.holders -= 1;
			if state.holders == 0 {
				states.remove(path);
			}
		}
		self.cond.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn test_shared_holders_coexist() {
		let locks = BlockLocks::new();
		let path = Path::new("/x/y");
		locks.lock_shared(path);
		locks.lock_shared(path);
		locks.unlock(path);
		locks.unlock(path);
		// fully released, an exclusive lock is immediately available
		locks.lock_exclusive(path);
		locks.unlock(path);
	}

	#[test]
	fn test_exclusive_waits_for_shared() {
		let locks = BlockLocks::new();
		let path = PathBuf::from("/x/z");
		locks.lock_shared(&path);

		let locks2 = locks.clone();
		let path2 = path.clone();
		let handle = std::thread::spawn(move || {
			locks2.lock_exclusive(&path2);
			locks2.unlock(&path2);
		});

		std::thread::sleep(Duration::from_millis(50));
		assert!(!handle.is_finished());
		locks.unlock(&path);
		handle.join().unwrap();
	}
}
