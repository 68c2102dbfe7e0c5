use std::fmt::Display;
use tracing::warn;

/// Teardown steps never fail the caller; failures are logged and dropped
pub trait BestEffort: Sized {
    fn best_effort(self, step: &str);
}

impl<T, E: Display> BestEffort for Result<T, E> {
    fn best_effort(self, step: &str) {
        if let Err(e) = self {
            warn!(step, "Teardown step failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_are_swallowed() {
        Err::<(), _>(std::io::Error::other("busy")).best_effort("remove data directory");
        Ok::<_, std::io::Error>(1).best_effort("noop");
    }
}
