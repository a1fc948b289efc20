//! Insertion notifications
//!
//! A trigger fires after every successful insert into a box (or any box of a
//! list): an optional callback runs on the inserting thread, and an optional
//! socket pair gets one wake byte so a poll/select loop can notice.

use std::fmt;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tracing::warn;

pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Trigger {
    callback: Option<Callback>,
    wake: Option<Arc<UnixStream>>,
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("callback", &self.callback.is_some())
            .field("wake", &self.wake.is_some())
            .finish()
    }
}

impl Trigger {
    /// Call `f` with the box name on every insert
    pub fn callback(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(f)),
            wake: None,
        }
    }

    /// Add a wakeup socket; returns the end to watch for readability
    ///
    /// Wake bytes coalesce: while unread bytes fill the socket buffer,
    /// further inserts do not block.
    pub fn with_wakeup(mut self) -> io::Result<(Self, UnixStream)> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        self.wake = Some(Arc::new(writer));
        Ok((self, reader))
    }

    pub fn is_empty(&self) -> bool {
        self.callback.is_none() && self.wake.is_none()
    }

    pub(crate) fn fire(&self, box_name: &str) {
        if let Some(callback) = &self.callback {
            callback(box_name);
        }
        if let Some(wake) = &self.wake {
            match (&**wake).write(&[1]) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!(box_name, error = %e, "Trigger::fire: wakeup write failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Mutex;

    #[test]
    fn test_callback_gets_box_name() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let trigger = Trigger::callback(move |name| sink.lock().unwrap().push(name.to_string()));
        trigger.fire("accept");
        trigger.fire("reject");
        assert_eq!(*seen.lock().unwrap(), vec!["accept", "reject"]);
    }

    #[test]
    fn test_wakeup_byte() {
        let (trigger, mut reader) = Trigger::default().with_wakeup().unwrap();
        trigger.fire("accept");
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1]);
    }

    #[test]
    fn test_empty() {
        assert!(Trigger::default().is_empty());
        assert!(!Trigger::callback(|_| {}).is_empty());
        Trigger::default().fire("nothing");
    }
}
