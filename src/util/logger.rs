use log::SetLoggerError;

/// Attempt to init a env_logger for the archive subsystem.
/// Does nothing if the "builtin_env_logger" feature is disabled.
///
/// The archive code logs through the `log` facade only. A host runtime that has its own
/// logger should disable the default feature and install that logger instead.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
