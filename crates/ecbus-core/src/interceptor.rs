//! Frame interception for capture and diagnostics.
//!
//! An interceptor sees every raw Ethernet frame the master sends or receives,
//! after encoding and before decoding. It can inspect, patch or drop frames,
//! which is enough for packet capture, fault injection and link analytics.

/// Hook invoked by the master loop around the hardware port.
///
/// # Examples
/// ```
/// use ecbus_core::interceptor::FrameInterceptor;
///
/// struct FrameLogger;
///
/// impl FrameInterceptor for FrameLogger {
///     fn on_receive(&mut self, frame: &mut [u8]) -> bool {
///         println!("rx {} bytes", frame.len());
///         true
///     }
///
///     fn on_send(&mut self, frame: &mut [u8]) -> bool {
///         println!("tx {} bytes", frame.len());
///         true
///     }
/// }
/// ```
pub trait FrameInterceptor: Send {
    /// Called for each received frame before its datagrams are dispatched.
    ///
    /// Returning `false` drops the frame; its datagrams stay outstanding and
    /// are eventually completed by the timeout sweep.
    fn on_receive(&mut self, frame: &mut [u8]) -> bool;

    /// Called for each fully built frame right before it is handed to the port.
    ///
    /// Returning `false` suppresses the send.
    fn on_send(&mut self, frame: &mut [u8]) -> bool;
}

/// Interceptor that passes every frame through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpInterceptor;

impl FrameInterceptor for NoOpInterceptor {
    fn on_receive(&mut self, _frame: &mut [u8]) -> bool {
        true
    }

    fn on_send(&mut self, _frame: &mut [u8]) -> bool {
        true
    }
}
