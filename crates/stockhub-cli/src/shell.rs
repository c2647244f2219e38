//! Interactive shell state and command handlers.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use stockhub_core::auth::{
    HttpIdentityProvider, Registration, SignUpOutcome, Subscription, TransitionCause,
};
use stockhub_core::{decide, Config, Page, RenderMode, RequestGateway, Router, SessionState, SessionStore};

use crate::command::{Command, HELP};

/// Maximum number of concurrent API requests for `get`
const MAX_CONCURRENT_REQUESTS: usize = 4;

/// Whether the read loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Shell {
    config: Config,
    store: SessionStore,
    router: Router,
    gateway: RequestGateway,
    _notices: Subscription,
}

impl Shell {
    pub fn new(config: Config, initial_fragment: &str) -> Result<Self> {
        let provider = Arc::new(HttpIdentityProvider::from_config(&config)?);
        let store = SessionStore::with_init_timeout(provider, config.init_timeout());
        let router = Router::new(store.clone(), initial_fragment);
        let gateway = RequestGateway::from_config(store.clone(), &config)?;

        // Sign-outs the user did not ask for need to be announced.
        let notices = store.subscribe(|event| match event.cause {
            TransitionCause::ForcedSignOut => {
                eprintln!("\nYou have been signed out. Please sign in again.");
            }
            TransitionCause::ProviderSignedOut => {
                eprintln!("\nYour session has expired. Please sign in again.");
            }
            _ => {}
        });

        Ok(Self {
            config,
            store,
            router,
            gateway,
            _notices: notices,
        })
    }

    /// Restore the previous session and start following provider changes.
    pub async fn start(&self) {
        if self.store.watch_provider().is_none() {
            debug!("Identity provider does not push session changes");
        }
        println!("Loading...");
        let state = self.store.initialize().await;
        info!(state = state.label(), "Session initialized");
        self.render();
    }

    /// Prompt showing the current page and what the gate allows.
    pub fn prompt(&self) -> String {
        let gate = match decide(&self.store.state()) {
            RenderMode::ShowLoadingIndicator => "loading",
            RenderMode::ShowLoginForm => "signed out",
            RenderMode::ShowProtectedContent => "signed in",
        };
        format!("stockhub [{} | {}] #{}> ", self.router.page().title(), gate, self.router.fragment())
    }

    /// Refresh the access token if it is close to expiry.
    pub async fn housekeeping(&self) {
        if self.store.refresh_if_due().await {
            debug!("Token refreshed before command");
        }
    }

    pub async fn handle(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Status => self.status(),
            Command::SignIn { email } => self.sign_in(email).await?,
            Command::SignUp { email, full_name } => self.sign_up(&email, full_name.as_deref()).await?,
            Command::SignOut => {
                if !self.store.sign_out().await {
                    println!("Already signed out.");
                }
                self.render();
            }
            Command::Go(page) => {
                self.router.navigate(page);
                self.render();
            }
            Command::Hash(fragment) => {
                self.router.on_fragment_change(&fragment);
                self.render();
            }
            Command::Get(paths) => self.get_all(paths).await,
            Command::WhoAmI => self.who_am_i().await,
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    // ===== Rendering =====

    fn render(&self) {
        let view = self.router.view();
        let state = self.store.state();
        println!("[#{}] {}", view.fragment(), view.page.title());

        match view.page {
            Page::Dashboard => match decide(&state) {
                RenderMode::ShowLoadingIndicator => println!("  Loading..."),
                RenderMode::ShowLoginForm => println!("  Please sign in to continue."),
                RenderMode::ShowProtectedContent => {
                    if let Some(session) = state.session() {
                        println!("  Welcome, {}.", session.identity.display_name());
                    }
                }
            },
            Page::Landing => match state.session() {
                Some(session) => println!("  Signed in as {}. Try 'go dashboard'.", session.identity.email),
                None => println!("  Welcome to StockHub. Try 'signin' or 'signup'."),
            },
            Page::SignIn => println!("  Use 'signin [email]' to sign in."),
            Page::SignUp => println!("  Use 'signup <email> [full name]' to create an account."),
        }
    }

    fn status(&self) {
        let (state, epoch) = self.store.snapshot();
        let view = self.router.view();
        println!("Session:  {} (epoch {})", state.label(), epoch);
        if let SessionState::Authenticated(session) = &state {
            println!("User:     {} <{}>", session.identity.display_name(), session.identity.email);
            if let Some(remaining) = session.credential.expires_in() {
                println!("Expires:  in {} min", remaining.num_minutes());
            }
        }
        println!("Page:     {} (#{})", view.page.title(), view.fragment());
        println!("Render:   {:?}", decide(&state));
    }

    // ===== Authentication =====

    async fn sign_in(&mut self, email: Option<String>) -> Result<()> {
        let email = match email.or_else(|| self.config.last_email.clone()) {
            Some(email) => email,
            None => prompt_line("Email: ").await?,
        };
        let password = prompt_password("Password: ").await?;

        match self.store.sign_in_with_password(&email, &password).await {
            Ok(session) => {
                println!("Signed in as {}.", session.identity.display_name());
                self.remember_email(&email);
            }
            Err(e) => {
                debug!(error = %e, "Sign-in failed");
                println!("{}", e.user_message());
            }
        }
        self.render();
        Ok(())
    }

    async fn sign_up(&mut self, email: &str, full_name: Option<&str>) -> Result<()> {
        let password = prompt_password("Password: ").await?;
        let confirm = prompt_password("Confirm password: ").await?;
        if password != confirm {
            println!("Passwords do not match.");
            return Ok(());
        }

        let registration = match Registration::new(email, &password, full_name) {
            Ok(registration) => registration,
            Err(e) => {
                println!("{}", e);
                return Ok(());
            }
        };

        match self.store.sign_up(&registration).await {
            Ok(SignUpOutcome::SignedIn(session)) => {
                println!("Account created. Signed in as {}.", session.identity.display_name());
                self.remember_email(email);
            }
            Ok(SignUpOutcome::ConfirmationRequired) => {
                println!("Account created. Check your email to confirm it, then sign in.");
                self.remember_email(email);
            }
            Err(e) => println!("{}", e.user_message()),
        }
        self.render();
        Ok(())
    }

    fn remember_email(&mut self, email: &str) {
        let email = email.trim().to_string();
        if self.config.last_email.as_deref() == Some(email.as_str()) {
            return;
        }
        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }

    // ===== API =====

    async fn get_all(&self, paths: Vec<String>) {
        let gateway = &self.gateway;
        let store = &self.store;

        let results: Vec<(String, Result<Option<Value>, String>)> = stream::iter(paths)
            .map(|path| async move {
                let result = gateway
                    .get::<Value>(&path)
                    .await
                    .map(|stamped| stamped.into_current(store))
                    .map_err(|e| e.user_message());
                (path, result)
            })
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await;

        for (path, result) in results {
            match result {
                Ok(Some(value)) => println!("{}:\n{}", path, pretty(&value)),
                Ok(None) => println!("{}: discarded (session changed)", path),
                Err(message) => println!("{}: {}", path, message),
            }
        }
    }

    async fn who_am_i(&self) {
        match self.gateway.get::<Value>("users/me").await {
            Ok(stamped) => match stamped.into_current(&self.store) {
                Some(value) => println!("{}", pretty(&value)),
                None => println!("Session changed before the response arrived."),
            },
            Err(e) => println!("{}", e.user_message()),
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// ===== Terminal input =====

/// Read one line from stdin without blocking the runtime.
pub async fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let line = tokio::task::spawn_blocking(|| -> io::Result<Option<String>> {
        let mut line = String::new();
        let read = io::stdin().read_line(&mut line)?;
        Ok((read > 0).then_some(line))
    })
    .await??;

    line.map(|l| l.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("stdin closed"))
}

async fn prompt_password(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    let password = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt)).await??;
    Ok(password)
}
