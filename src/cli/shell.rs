use anyhow::{Context, Result};
use clap::Args;
use std::cell::RefCell;
use std::io::{self, IsTerminal};
use std::rc::Rc;

use crate::config::Config;
use crate::interp::Prelude;
use crate::loader::HttpFetcher;
use crate::session::{
    EditorInput, Injection, LaunchOptions, LineSource, ScriptedInput, Session, SessionConfig,
    demo_counter,
};

#[derive(Args)]
pub struct ShellArgs {
    /// Inject the demo counter capability as `obj`
    #[arg(long)]
    pub demo: bool,
}

/// Session settings shared by `shell` and `run`.
pub fn session_config(config: &Config) -> Result<SessionConfig> {
    let fetcher = HttpFetcher::new(&config.loader.user_agent)
        .context("Failed to build the HTTP client for remote sources")?;
    Ok(SessionConfig {
        prelude: Prelude::new(),
        local_root: config.local_root(),
        loader: config.loader_settings(),
        fetcher: Rc::new(fetcher),
        output: Rc::new(RefCell::new(io::stdout())),
        banners: config.shell.banners,
    })
}

pub fn run(args: ShellArgs, config: &Config) -> Result<()> {
    let input: Rc<RefCell<dyn LineSource>> = if io::stdin().is_terminal() {
        let history = config.history_file();
        if history.is_some() {
            config.paths.ensure_dirs()?;
        }
        Rc::new(RefCell::new(EditorInput::new(history, config.shell.history_size)?))
    } else {
        Rc::new(RefCell::new(ScriptedInput::from_reader(io::stdin().lock())?))
    };

    let mut options = LaunchOptions::new(session_config(config)?);
    options.input = Some(input.clone());
    if args.demo {
        let build: Injection = Box::new(demo_counter);
        options.inject = Some(("obj".to_string(), build));
    }

    let session = Session::launch(options).map_err(|e| anyhow::anyhow!("Failed to start session: {e}"))?;
    session.interact(&input)?;
    Ok(())
}
