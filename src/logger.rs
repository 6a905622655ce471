use log::LevelFilter;
use log4rs::{
    Config,
    append::console::{ConsoleAppender, Target},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};

use crate::error::GraphError;

/// Installs a stderr console logger. Stdout stays free for the lowered graph.
pub fn init_log(level: LevelFilter) -> Result<(), GraphError> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("[{h({l})} - {f}:{L}] {m}{n}")))
        .build();
    let appender = Appender::builder().build("stderr", Box::new(stderr));

    let config = Config::builder()
        .appender(appender)
        .build(Root::builder().appender("stderr").build(level))
        .map_err(|err| GraphError::LoggerInit {
            reason: err.to_string(),
        })?;
    log4rs::init_config(config).map_err(|err| GraphError::LoggerInit {
        reason: err.to_string(),
    })?;
    update_panic_hook();

    Ok(())
}

fn update_panic_hook() {
    let hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {}", info);
        hook(info);
    }));
}
