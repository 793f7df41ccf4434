use crate::artifacts::{self, ArtifactParams};
use crate::config_files::{load_document, save_document, set_slot};
use crate::{display_relative, output, Context, UrlctlError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::time::Duration;

/// Raw entropy per generated token.
pub(crate) const SECRET_BYTES: usize = 32;

const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
const DEFAULT_SMTP_PORT: u16 = 587;
const TELEGRAM_API_ENV: &str = "URLCTL_TELEGRAM_API_BASE";
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);
const TELEGRAM_GREETING: &str = "WebFuzzing Pro configured successfully!";

pub(crate) trait Prompter {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, UrlctlError>;
    /// Free-text answer; empty when the operator just presses Enter.
    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String, UrlctlError>;
    fn password(&self, prompt: &str) -> Result<String, UrlctlError>;
}

pub(crate) struct DialoguerPrompter {
    theme: ColorfulTheme,
}

impl DialoguerPrompter {
    pub(crate) fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Prompter for DialoguerPrompter {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, UrlctlError> {
        Ok(Confirm::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default)
            .interact()?)
    }

    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String, UrlctlError> {
        let mut input = Input::<String>::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        Ok(input.interact_text()?.trim().to_string())
    }

    fn password(&self, prompt: &str) -> Result<String, UrlctlError> {
        Ok(Password::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()?
            .trim()
            .to_string())
    }
}

pub(crate) trait TelegramApi {
    fn send_message(&self, bot_token: &str, chat_id: &str, text: &str) -> Result<(), String>;
}

pub(crate) struct HttpTelegramApi {
    base_url: String,
}

impl HttpTelegramApi {
    pub(crate) fn from_env() -> Self {
        let raw = env::var(TELEGRAM_API_ENV)
            .unwrap_or_else(|_| "https://api.telegram.org".to_string());
        Self::with_base_url(&raw)
    }

    pub(crate) fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl TelegramApi for HttpTelegramApi {
    fn send_message(&self, bot_token: &str, chat_id: &str, text: &str) -> Result<(), String> {
        let url = format!("{}/bot{bot_token}/sendMessage", self.base_url);
        let client = reqwest::blocking::Client::builder()
            .timeout(TELEGRAM_TIMEOUT)
            .build()
            .map_err(|err| err.to_string())?;
        let response = client
            .post(&url)
            .header("User-Agent", "urlctl")
            .json(&json!({"chat_id": chat_id, "text": text}))
            .send()
            // the URL embeds the bot token; keep it out of the message
            .map_err(|err| err.without_url().to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(format!("HTTP {status} {body}"))
    }
}

pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone)]
pub(crate) struct GeneratedSecrets {
    pub(crate) secret_key: String,
    pub(crate) api_key: String,
}

/// Rotates `web.secret_key` and `api.api_key`. Never creates the document.
pub(crate) fn generate_secrets(config_path: &Path) -> Result<GeneratedSecrets, UrlctlError> {
    let mut doc = load_document(config_path)?;
    let secrets = GeneratedSecrets {
        secret_key: generate_token(),
        api_key: generate_token(),
    };
    set_slot(&mut doc, "web.secret_key", json!(secrets.secret_key))?;
    set_slot(&mut doc, "api.api_key", json!(secrets.api_key))?;
    save_document(config_path, &doc)?;
    tracing::info!(path = %config_path.display(), "rotated web and api secrets");
    Ok(secrets)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlowOutcome {
    Saved { warning: Option<String> },
    Skipped(String),
}

fn update_document(
    config_path: &Path,
    updates: Vec<(&str, Value)>,
) -> Result<(), UrlctlError> {
    let mut doc = load_document(config_path)?;
    for (slot, value) in updates {
        set_slot(&mut doc, slot, value)?;
    }
    save_document(config_path, &doc)
}

pub(crate) fn configure_telegram(
    config_path: &Path,
    prompter: &dyn Prompter,
    api: &dyn TelegramApi,
) -> Result<FlowOutcome, UrlctlError> {
    println!();
    println!("{}", style("Telegram bot").bold());
    println!(
        "{}",
        style(
            "1. Open Telegram and message @BotFather
2. Send /newbot and follow the instructions
3. Copy the bot token
4. Message @userinfobot to get your chat id"
        )
        .dim()
    );
    let bot_token = prompter.input("Bot token (Enter to skip)", None)?;
    if bot_token.is_empty() {
        return Ok(FlowOutcome::Skipped("no bot token entered".to_string()));
    }
    let chat_id = prompter.input("Chat id", None)?;
    if chat_id.is_empty() {
        return Ok(FlowOutcome::Skipped("no chat id entered".to_string()));
    }

    update_document(
        config_path,
        vec![
            ("notifications.telegram.enabled", json!(true)),
            ("notifications.telegram.bot_token", json!(bot_token)),
            ("notifications.telegram.chat_id", json!(chat_id)),
        ],
    )?;

    let warning = match api.send_message(&bot_token, &chat_id, TELEGRAM_GREETING) {
        Ok(()) => None,
        Err(err) => {
            tracing::warn!(error = %err, "telegram verification failed");
            Some(format!("test message failed: {err}"))
        }
    };
    Ok(FlowOutcome::Saved { warning })
}

pub(crate) fn configure_email(
    config_path: &Path,
    prompter: &dyn Prompter,
) -> Result<FlowOutcome, UrlctlError> {
    println!();
    println!("{}", style("Email").bold());
    println!(
        "{}",
        style(
            "Gmail needs an app password:
1. Visit https://myaccount.google.com/security
2. Enable 2-step verification
3. Generate an app password for this host"
        )
        .dim()
    );
    let email = prompter.input("Email address (Enter to skip)", None)?;
    if email.is_empty() {
        return Ok(FlowOutcome::Skipped("no email address entered".to_string()));
    }
    let password = prompter.password("App password")?;
    if password.is_empty() {
        return Ok(FlowOutcome::Skipped("no password entered".to_string()));
    }
    let smtp_server = prompter.input("SMTP server", Some(DEFAULT_SMTP_SERVER))?;
    let smtp_server = if smtp_server.is_empty() {
        DEFAULT_SMTP_SERVER.to_string()
    } else {
        smtp_server
    };
    let port_text = prompter.input("SMTP port", Some(&DEFAULT_SMTP_PORT.to_string()))?;
    let smtp_port = if port_text.is_empty() {
        DEFAULT_SMTP_PORT
    } else {
        port_text.parse::<u16>().map_err(|_| {
            UrlctlError::Config(format!("SMTP port must be a number, got '{port_text}'"))
        })?
    };

    println!("{}", style("Recipients (empty line to finish)").dim());
    let mut recipients = Vec::new();
    loop {
        let recipient = prompter.input("  Recipient", None)?;
        if recipient.is_empty() {
            break;
        }
        recipients.push(recipient);
    }
    if recipients.is_empty() {
        recipients.push(email.clone());
    }

    update_document(
        config_path,
        vec![
            ("notifications.email.enabled", json!(true)),
            ("notifications.email.smtp_server", json!(smtp_server)),
            ("notifications.email.smtp_port", json!(smtp_port)),
            ("notifications.email.username", json!(email)),
            ("notifications.email.password", json!(password)),
            ("notifications.email.recipients", json!(recipients)),
        ],
    )?;
    Ok(FlowOutcome::Saved { warning: None })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StepStatus {
    Ok,
    Warning,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SetupStep {
    pub(crate) step: String,
    pub(crate) status: StepStatus,
    pub(crate) detail: String,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct SetupTally {
    pub(crate) steps: Vec<SetupStep>,
    #[serde(skip)]
    quiet: bool,
}

impl SetupTally {
    fn record(&mut self, step: &str, status: StepStatus, detail: impl Into<String>) {
        let detail = detail.into();
        let label = match status {
            StepStatus::Ok => style("[ok]").green(),
            StepStatus::Warning => style("[warn]").yellow(),
            StepStatus::Failed => style("[fail]").red(),
            StepStatus::Skipped => style("[skip]").dim(),
        };
        if !self.quiet {
            println!("{label} {step} - {detail}");
        }
        self.steps.push(SetupStep {
            step: step.to_string(),
            status,
            detail,
        });
    }

    fn record_flow(&mut self, step: &str, result: Result<FlowOutcome, UrlctlError>) {
        match result {
            Ok(FlowOutcome::Saved { warning: None }) => {
                self.record(step, StepStatus::Ok, "credentials saved")
            }
            Ok(FlowOutcome::Saved {
                warning: Some(warning),
            }) => self.record(step, StepStatus::Warning, format!("credentials saved; {warning}")),
            Ok(FlowOutcome::Skipped(reason)) => self.record(step, StepStatus::Skipped, reason),
            Err(err) => self.record(step, StepStatus::Failed, err.to_string()),
        }
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }

    fn summary(&self) -> String {
        format!(
            "{} ok, {} warnings, {} failed, {} skipped",
            self.count(StepStatus::Ok),
            self.count(StepStatus::Warning),
            self.count(StepStatus::Failed),
            self.count(StepStatus::Skipped)
        )
    }
}

fn run_optional_flow(
    tally: &mut SetupTally,
    prompter: Option<&dyn Prompter>,
    step: &str,
    question: &str,
    flow: impl FnOnce(&dyn Prompter) -> Result<FlowOutcome, UrlctlError>,
) {
    let Some(prompter) = prompter else {
        tally.record(step, StepStatus::Skipped, "stdin is not a terminal");
        return;
    };
    match prompter.confirm(question, false) {
        Ok(true) => tally.record_flow(step, flow(prompter)),
        Ok(false) => tally.record(step, StepStatus::Skipped, "declined"),
        Err(err) => tally.record(step, StepStatus::Failed, err.to_string()),
    }
}

pub(crate) fn handle_setup(ctx: &Context) -> Result<(), UrlctlError> {
    let config_path = ctx.config_document_path();
    if !ctx.json {
        println!("{}", style("WebFuzzing Pro - environment setup").bold().cyan());
        println!(
            "{}",
            style(format!("Project root: {}", ctx.root.display())).dim()
        );
    }

    // A missing document stops the whole pass before any prompt.
    let secrets = generate_secrets(&config_path)?;
    let mut tally = SetupTally {
        quiet: ctx.json,
        ..SetupTally::default()
    };
    tally.record(
        "secrets",
        StepStatus::Ok,
        format!(
            "web.secret_key and api.api_key written to {}",
            display_relative(&config_path, &ctx.root)
        ),
    );
    if !ctx.json {
        println!("API key: {}", style(&secrets.api_key).bold());
    }

    let dialoguer_prompter = DialoguerPrompter::new();
    let prompter: Option<&dyn Prompter> = if io::stdin().is_terminal() {
        Some(&dialoguer_prompter)
    } else {
        None
    };
    let telegram_api = HttpTelegramApi::from_env();

    run_optional_flow(
        &mut tally,
        prompter,
        "telegram",
        "Configure Telegram notifications?",
        |prompter| configure_telegram(&config_path, prompter, &telegram_api),
    );
    run_optional_flow(
        &mut tally,
        prompter,
        "email",
        "Configure email notifications?",
        |prompter| configure_email(&config_path, prompter),
    );

    let params = ArtifactParams::for_host(&ctx.root, ctx.python.as_deref());
    for (path, result) in artifacts::write_artifacts(&params) {
        let step = display_relative(&path, &ctx.root);
        match result {
            Ok(()) => tally.record(&step, StepStatus::Ok, "written"),
            Err(err) => tally.record(&step, StepStatus::Failed, err.to_string()),
        }
    }
    if params.include_service_unit {
        if let Some(warning) = artifacts::interpreter_warning(ctx.python.as_deref()) {
            tally.record("interpreter", StepStatus::Warning, warning);
        }
    }

    if let Some(prompter) = prompter {
        match prompter.confirm("Show scheduled task instructions?", false) {
            Ok(true) => {
                println!();
                for line in artifacts::scheduled_task_instructions(&params, cfg!(windows)) {
                    println!("{line}");
                }
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(error = %err, "scheduled task prompt failed"),
        }
    }

    if ctx.json {
        return output(
            ctx,
            json!({
                "config_document": config_path,
                "api_key": secrets.api_key,
                "steps": tally.steps,
                "summary": tally.summary(),
            }),
        );
    }
    println!();
    println!("{} {}", style("Setup finished:").bold(), tally.summary());
    println!("  Windows:   {}", artifacts::WINDOWS_SCRIPT);
    println!("  Linux/Mac: ./{}", artifacts::UNIX_SCRIPT);
    println!("  Manual:    {} main.py --mode all", ctx.python_display());
    Ok(())
}
