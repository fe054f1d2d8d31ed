//! Ties the transfer queue to the game's frame tick.

use std::sync::Arc;

use log::info;

use gantry_intercept::{Callback, Hook, Result};

use crate::transfer::TransferQueue;

/// Gameloop tick call site in the stock game binary.
pub const DEFAULT_GAMELOOP_SITE: usize = 0x748DA3;

/// Hooks the gameloop and pumps the queue once per tick. Uninstalls on
/// drop.
pub struct GameloopPump {
    hook: Hook,
}

impl GameloopPump {
    /// Install at `site`.
    ///
    /// # Safety
    /// `site` must be a live, hookable patch site in the running game; see
    /// [`Hook::install`].
    pub unsafe fn install(site: usize, queue: Arc<TransferQueue>) -> Result<Self> {
        let mut hook = Hook::new(site, 0);
        hook.on_before(Callback::Empty(Box::new(move || {
            queue.perform();
            true
        })));
        hook.install()?;
        info!("gameloop pump installed at {site:#x}");
        Ok(Self { hook })
    }

    pub fn site(&self) -> usize {
        self.hook.target()
    }
}
