//! Last-value subject used for counters and list snapshots.
//!
//! Holds the latest value and marks every receiver as changed at the moment
//! a new value is published. Receivers read the value with `borrow()` or wait
//! for the next publication with `changed().await`.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Subject<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Subject<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Subject { tx }
    }

    /// Publish a new value. Works with no receivers attached.
    pub fn next(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate the current value in place and publish it
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Mutate in place; receivers are only notified when `f` returns true
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Read the current value without cloning it
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn value(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Default> Default for Subject<T> {
    fn default() -> Self {
        Subject::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_keeps_latest_value() {
        let subject = Subject::new(0usize);
        subject.next(3);
        subject.next(5);
        assert_eq!(subject.value(), 5);
    }

    #[test]
    fn test_subscriber_sees_change_immediately() {
        let subject = Subject::new(Vec::<i32>::new());
        let mut rx = subject.subscribe();
        assert!(!rx.has_changed().unwrap());

        subject.update(|v| v.push(7));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), vec![7]);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_update_if_skips_unchanged() {
        let subject = Subject::new(1u32);
        let mut rx = subject.subscribe();
        assert!(!subject.update_if(|_| false));
        assert!(!rx.has_changed().unwrap());
        assert!(subject.update_if(|v| {
            *v += 1;
            true
        }));
        assert_eq!(*rx.borrow_and_update(), 2);
        assert_eq!(subject.with(|v| *v * 10), 20);
    }

    #[test]
    fn test_late_subscriber_gets_current_value() {
        let subject = Subject::new(String::from("a"));
        subject.next("b".to_string());
        let rx = subject.subscribe();
        assert_eq!(rx.borrow().as_str(), "b");
        assert_eq!(subject.observer_count(), 1);
    }
}
