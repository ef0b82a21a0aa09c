//! Panic payload helpers for isolated callbacks and worker tasks

use std::any::Any;

/// Best-effort text of a caught panic payload
pub(crate) fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_describe_str_and_string() {
        let err = catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(describe(err.as_ref()), "static text");

        let err = catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(describe(err.as_ref()), "formatted 7");
    }
}
