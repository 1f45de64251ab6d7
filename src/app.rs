//! Defines the read-only application state shared by the binaries.

use crate::conf::Settings;
use crate::dispatch::{Dispatcher, EchoHandler};
use anyhow::{anyhow, Context, Result};
use envy::from_env;
use once_cell::sync::OnceCell;

/// An App is an initialized application state, derived from
/// settings.
pub struct App {
    /// The dispatcher running the deployed record handler.
    pub dispatcher: Dispatcher<EchoHandler>,
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub fn new(settings: Settings) -> Self {
        App {
            dispatcher: Dispatcher::new(EchoHandler, settings),
        }
    }

    pub fn settings(&self) -> &Settings {
        self.dispatcher.settings()
    }
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance.
pub fn init() -> Result<()> {
    let settings = from_env().context("Invalid dispatcher settings")?;
    CURRENT
        .set(App::new(settings))
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}
