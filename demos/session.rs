extern crate pmc_session;

use std::thread;
use std::time::Duration;

use pmc_session::{native::Platform, CpuSet, EventCatalog, MeasurementSession, ResultSink};

fn main() {
	env_logger::init();

	let catalog = EventCatalog::new(vec!["instructions", "cycles"]).unwrap();
	let mut session = MeasurementSession::new(Platform::default());

	// Count on every CPU of the host
	session.prepare(catalog, &CpuSet::All).unwrap();

	// Start the counters
	session.start().unwrap();

	for i in 1..10 {
		// do some stuff...
		println!("{}", i);
		thread::sleep(Duration::from_millis(100));
	}

	// Stop the counters - they can be restarted any time
	let samples = session.stop().unwrap();
	session.emit(&samples, &ResultSink::stdout()).unwrap();

	session.finalize();
}
