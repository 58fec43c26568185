//! Logging macros. Every line is tagged with the identity of the node
//! instance it comes from, given as the first macro argument:
//!
//! ```no_compile
//! pf_debug!(self.me; "recv {}", msg);
//! ```

use env_logger::Env;

#[macro_export]
macro_rules! pf_trace {
    ($me:expr; $($fmt_args:tt)*) => {
        log::trace!("({}) {}", $me, format!($($fmt_args)*))
    };
}

#[macro_export]
macro_rules! pf_debug {
    ($me:expr; $($fmt_args:tt)*) => {
        log::debug!("({}) {}", $me, format!($($fmt_args)*))
    };
}

#[macro_export]
macro_rules! pf_info {
    ($me:expr; $($fmt_args:tt)*) => {
        log::info!("({}) {}", $me, format!($($fmt_args)*))
    };
}

#[macro_export]
macro_rules! pf_warn {
    ($me:expr; $($fmt_args:tt)*) => {
        log::warn!("({}) {}", $me, format!($($fmt_args)*))
    };
}

#[macro_export]
macro_rules! pf_error {
    ($me:expr; $($fmt_args:tt)*) => {
        log::error!("({}) {}", $me, format!($($fmt_args)*))
    };
}

/// Logs an error tagged with `$me`, then evaluates to `Err(DsmError::Msg)`
/// carrying the untagged message.
#[macro_export]
macro_rules! logged_err {
    ($me:expr; $($fmt_args:tt)*) => {{
        let msg = format!($($fmt_args)*);
        log::error!("({}) {}", $me, msg);
        Err($crate::DsmError::msg(msg))
    }};
}

/// Sets up `env_logger` at "info" unless `RUST_LOG` says otherwise. Calling
/// it again is a no-op.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

#[cfg(test)]
mod print_tests {
    use crate::message::NodePtr;
    use crate::utils::DsmError;

    fn refuse(me: &NodePtr, page: u32) -> Result<(), DsmError> {
        logged_err!(me; "page {} refused by {}", page, me.id)
    }

    #[test]
    fn logged_err_drops_identity() -> Result<(), DsmError> {
        let me = NodePtr::new(3, "127.0.0.1:8005".parse()?);
        assert_eq!(refuse(&me, 7), Err(DsmError::msg("page 7 refused by 3")));
        assert_eq!(
            logged_err!("cm-backup"; "no peer"),
            Err::<(), DsmError>(DsmError::msg("no peer"))
        );
        Ok(())
    }
}
