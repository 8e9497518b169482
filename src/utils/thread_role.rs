/// Marks the host's presentation thread
///
/// The presentation layer is single-threaded; blocking network I/O on it is a
/// programming error. The thread calls [`mark_presentation_thread`] once and
/// blocking services check [`is_presentation_thread`].
use std::cell::Cell;

thread_local! {
    static PRESENTATION: Cell<bool> = const { Cell::new(false) };
}

pub fn mark_presentation_thread() {
    PRESENTATION.with(|flag| flag.set(true));
}

pub fn is_presentation_thread() -> bool {
    PRESENTATION.with(|flag| flag.get())
}

/// Run `f` with the current thread flagged as the presentation thread.
pub fn as_presentation_thread<T>(f: impl FnOnce() -> T) -> T {
    let previous = PRESENTATION.with(|flag| flag.replace(true));
    let out = f();
    PRESENTATION.with(|flag| flag.set(previous));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_thread_local() {
        assert!(!is_presentation_thread());
        as_presentation_thread(|| {
            assert!(is_presentation_thread());
            let other = std::thread::spawn(is_presentation_thread).join().unwrap();
            assert!(!other);
        });
        assert!(!is_presentation_thread());
    }
}
