//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event
//! loop until the process exits.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::info;

use crate::context::AppContext;
use crate::handler::handle_message;
use crate::router::handle_callback;

pub struct TelegramAdapter {
    ctx: Arc<AppContext>,
}

impl TelegramAdapter {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Connect to Telegram and drive the long-polling loop. Runs for the
    /// lifetime of the process.
    pub async fn run(self) {
        info!("starting long-polling dispatcher");

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_callback_query().endpoint(handle_callback));

        let bot = self.ctx.bot.clone();
        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![Arc::clone(&self.ctx)])
            .default_handler(|_upd| async {})
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;
    }
}
