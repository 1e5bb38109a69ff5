use crate::{Error, Result};

/// One direction of the flow control of a channel (RFC 4254, section 5.2).
///
/// The window counts the bytes that were granted by the receiver and the bytes that were consumed
/// by the sender; `consumed <= granted` always holds. The peer can never make the window larger
/// than `u32::MAX` bytes.
#[derive(Debug, Clone)]
pub(super) struct Window {
    granted: u64,
    consumed: u64,
}

impl Window {
    pub fn new(initial: u32) -> Window {
        Window { granted: initial as u64, consumed: 0 }
    }

    /// Number of bytes that may still be sent.
    pub fn available(&self) -> u64 {
        self.granted - self.consumed
    }

    pub fn consume(&mut self, len: usize) -> Result<()> {
        if len as u64 > self.available() {
            return Err(Error::ChannelWindowExceeded)
        }
        self.consumed += len as u64;
        Ok(())
    }

    pub fn adjust(&mut self, adjust: u32) -> Result<()> {
        if self.available() + adjust as u64 > u32::MAX as u64 {
            return Err(Error::ChannelProtocol("window adjust overflows the window"))
        }
        self.granted += adjust as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_and_adjust() {
        let mut window = Window::new(100);
        window.consume(60).unwrap();
        assert_eq!(window.available(), 40);
        assert!(matches!(window.consume(41), Err(Error::ChannelWindowExceeded)));
        assert_eq!(window.available(), 40);

        window.adjust(25).unwrap();
        assert_eq!(window.available(), 65);
        window.consume(65).unwrap();
        assert_eq!(window.available(), 0);
        window.consume(0).unwrap();
    }

    #[test]
    fn test_adjust_adds_exactly() {
        let mut window = Window::new(0);
        for adjust in [1, 1000, 32768, 7] {
            let before = window.granted;
            window.adjust(adjust).unwrap();
            assert_eq!(window.granted - before, adjust as u64);
            assert!(window.consumed <= window.granted);
            window.consume(adjust as usize / 2).unwrap();
        }
    }

    #[test]
    fn test_adjust_overflow() {
        let mut window = Window::new(u32::MAX - 10);
        assert!(window.adjust(11).is_err());
        window.adjust(10).unwrap();
        window.consume(100).unwrap();
        window.adjust(100).unwrap();
        assert_eq!(window.available(), u32::MAX as u64);
    }
}
