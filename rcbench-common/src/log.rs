// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::Once;

use env_logger::{Builder, Target};

/// Initialize the global logger once. An explicit level filter, usually
/// from a command line verbosity flag, overrides `RUST_LOG`.
pub fn init(level_filter: Option<log::LevelFilter>) {
    static INIT_ONCE: Once = Once::new();
    INIT_ONCE.call_once(|| {
        let mut builder = Builder::from_default_env();
        if let Some(filter) = level_filter {
            builder.filter_level(filter);
        }
        builder.target(Target::Stdout);
        if builder.try_init().is_err() {
            eprintln!("failed to initialize logging");
        }
    });
}

#[macro_export]
macro_rules! qlog {
    ($lvl:expr, $ctx:expr, $($arg:tt)*) => ( {
        ::rcbench_common::log::init(None);
        ::log::log!($lvl, "[{}] {}", $ctx, format!($($arg)*));
    } )
}
#[macro_export]
macro_rules! qerror {
    ($ctx:ident, $($arg:tt)*) => ( ::rcbench_common::qlog!(::log::Level::Error, $ctx, $($arg)*); );
    ($($arg:tt)*) => ( { ::rcbench_common::log::init(None); ::log::log!(::log::Level::Error, $($arg)*); } );
}
#[macro_export]
macro_rules! qwarn {
    ($ctx:ident, $($arg:tt)*) => ( ::rcbench_common::qlog!(::log::Level::Warn, $ctx, $($arg)*););
    ($($arg:tt)*) => ( { ::rcbench_common::log::init(None); ::log::log!(::log::Level::Warn, $($arg)*); } );
}
#[macro_export]
macro_rules! qinfo {
    ($ctx:ident, $($arg:tt)*) => ( ::rcbench_common::qlog!(::log::Level::Info, $ctx, $($arg)*););
    ($($arg:tt)*) => ( { ::rcbench_common::log::init(None); ::log::log!(::log::Level::Info, $($arg)*); } );
}
#[macro_export]
macro_rules! qdebug {
    ($ctx:ident, $($arg:tt)*) => ( ::rcbench_common::qlog!(::log::Level::Debug, $ctx, $($arg)*););
    ($($arg:tt)*) => ( { ::rcbench_common::log::init(None); ::log::log!(::log::Level::Debug, $($arg)*); } );
}
#[macro_export]
macro_rules! qtrace {
    ($ctx:ident, $($arg:tt)*) => ( ::rcbench_common::qlog!(::log::Level::Trace, $ctx, $($arg)*););
    ($($arg:tt)*) => ( { ::rcbench_common::log::init(None); ::log::log!(::log::Level::Trace, $($arg)*); } );
}
