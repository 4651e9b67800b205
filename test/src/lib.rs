//! Testing utilities for headerchain crates.
pub mod block;

/// Assert that an expression matches a pattern.
#[macro_export]
macro_rules! assert_matches {
    ($left:expr, $( $pattern:pat_param )|+ $( if $guard: expr )? $(,)?) => {
        match $left {
            $( $pattern )|+ $( if $guard )? => {}
            ref left_val => {
                panic!(
                    "assertion failed: `{:?}` does not match `{}`",
                    left_val,
                    stringify!($($pattern)|+ $(if $guard)?)
                );
            }
        }
    };
}

pub mod logger {
    use chrono::prelude::*;
    use colored::*;
    use log::*;
    use once_cell::sync::OnceCell;

    struct Logger {
        level: Level,
    }

    impl Log for Logger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                println!(
                    "test> {} [{}] {}",
                    Local::now().format("%H:%M:%S%.3f").to_string().dimmed(),
                    record.target().bold(),
                    record.args()
                )
            }
        }

        fn flush(&self) {}
    }

    static INIT: OnceCell<()> = OnceCell::new();

    /// Install the test logger. Can be called any number of times.
    pub fn init(level: Level) {
        INIT.get_or_init(|| {
            log::set_boxed_logger(Box::new(Logger { level })).ok();
            log::set_max_level(level.to_level_filter());
        });
    }
}
