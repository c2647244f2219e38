//! Shell command parsing.

use stockhub_core::Page;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    SignIn { email: Option<String> },
    SignUp { email: String, full_name: Option<String> },
    SignOut,
    Go(Page),
    Hash(String),
    Get(Vec<String>),
    WhoAmI,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  status                      Show session, page and render mode
  signin [email]              Sign in (prompts for password)
  signup <email> [full name]  Create an account
  signout                     Sign out
  go <landing|signin|signup|dashboard>
                              Navigate to a page
  hash <fragment>             Simulate a location change, e.g. hash #dashboard
  get <path>...               GET one or more API paths concurrently
  whoami                      Fetch the signed-in user from the API
  help                        Show this help
  quit                        Exit";

impl Command {
    /// Parse one input line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match name.to_ascii_lowercase().as_str() {
            "status" => Command::Status,
            "signin" | "login" => Command::SignIn {
                email: args.first().map(|s| s.to_string()),
            },
            "signup" | "register" => {
                let (email, rest) = args
                    .split_first()
                    .ok_or_else(|| "Usage: signup <email> [full name]".to_string())?;
                let full_name = (!rest.is_empty()).then(|| rest.join(" "));
                Command::SignUp {
                    email: email.to_string(),
                    full_name,
                }
            }
            "signout" | "logout" => Command::SignOut,
            "go" => {
                let target = args.first().ok_or_else(|| "Usage: go <page>".to_string())?;
                let page = Page::from_name(target).ok_or_else(|| format!("Unknown page: {}", target))?;
                Command::Go(page)
            }
            "hash" => Command::Hash(args.first().copied().unwrap_or_default().to_string()),
            "get" => {
                if args.is_empty() {
                    return Err("Usage: get <path>...".to_string());
                }
                Command::Get(args.iter().map(|s| s.to_string()).collect())
            }
            "whoami" => Command::WhoAmI,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("Unknown command: {} (try 'help')", other)),
        };
        Ok(Some(command))
    }
}
