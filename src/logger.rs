// SPDX-License-Identifier: Apache-2.0

//! `log` facade backed by the serial console.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        cfg!(feature = "log-serial")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(all(feature = "log-serial", not(test)))]
        {
            use core::fmt::Write;
            let _ = writeln!(
                crate::serial::Serial,
                "{}: {}",
                record.level(),
                record.args()
            );
        }
        #[cfg(test)]
        println!("{}: {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
