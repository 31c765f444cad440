//! Console output for the early-boot environment.
//!
//! There is no syslog and no journal this early, so everything goes to the
//! kernel console via stdout/stderr with a program tag the way busybox-style
//! init tools do it.

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        println!("rootprep: {}", format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! etrace {
    ($($arg:tt)*) => {
        eprintln!("rootprep: {}:{}: {}", file!(), line!(), format_args!($($arg)*));
    };
}
