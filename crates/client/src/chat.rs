use courier::{Command, CommandHandler};

pub const WELCOME: u16 = 0;
pub const CHAT: u16 = 1;
pub const HEARTBEAT: u16 = 2;

/// Logs what the server relays to us.
pub struct Printer;

impl CommandHandler<()> for Printer {
    fn on_guaranteed(&self, _source: (), command: &Command) {
        let text = String::from_utf8_lossy(command.payload());
        match command.kind() {
            Some(WELCOME) => log::info!("Server: {}", text),
            Some(CHAT) => log::info!("Chat: {}", text),
            other => log::debug!("Unhandled guaranteed command {:?}", other),
        }
    }
}
