//! Hooks exposed to the extension host. The host itself lives out of
//! process; the server only knows this capability surface.

/// Callbacks a room fires as its sessions act. `mouse_down` is consulted
/// synchronously and may cancel the click.
pub trait ExtensionHost: Send + Sync {
    fn load_plugins(&self, _names: &[String]) {}
    fn user_join(&self, _session: u16) {}
    fn user_leave(&self, _session: u16) {}
    /// Returns true to cancel the click.
    fn mouse_down(&self, _session: u16) -> bool {
        false
    }
    fn mouse_up(&self, _session: u16) {}
    fn message(&self, _session: u16, _text: &str) {}
    fn command(&self, _session: u16, _line: &str) {}
    fn tick(&self) {}
}

/// Host used when no scripting backend is attached.
pub struct NoopHost;

impl ExtensionHost for NoopHost {}
