use chrono::{DateTime, Utc};

/// Source of write timestamps.
pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Test clock that only moves when told to.
#[cfg(test)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
	pub fn new(start: DateTime<Utc>) -> Self {
		Self(std::sync::Mutex::new(start))
	}

	pub fn set(&self, at: DateTime<Utc>) {
		*self.0.lock().unwrap() = at;
	}

	pub fn advance(&self, by: chrono::Duration) {
		let mut now = self.0.lock().unwrap();
		*now += by;
	}
}

#[cfg(test)]
impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.0.lock().unwrap()
	}
}
