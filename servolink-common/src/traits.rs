//! Common traits

/// A byte-oriented serial port as seen by the framing layer
///
/// Opening the device and configuring its baud rate are the application's
/// business; the stack only pulls received bytes and pushes complete
/// frames. Implementations must not block: `read_byte` returns `None`
/// when the receiver is empty, and a caller checks `write_capacity`
/// before committing a frame with `write_all`.
pub trait SerialPort {
    /// Read a single received byte, or `None` if nothing is pending
    fn read_byte(&mut self) -> Option<u8>;

    /// Number of bytes the transmitter can currently accept
    fn write_capacity(&self) -> usize;

    /// Queue bytes for transmission
    ///
    /// Callers only pass as many bytes as `write_capacity` reported, so
    /// implementations may treat overflow as a programming error.
    fn write_all(&mut self, data: &[u8]);

    /// Push any buffered bytes out to the wire
    fn flush(&mut self) {}
}
