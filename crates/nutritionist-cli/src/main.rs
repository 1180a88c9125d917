use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nutritionist_api::{NutritionistApi, API_CONTRACT_VERSION};
use nutritionist_core::{format_date, parse_date, EmployeeId, MenuItemId, OrderId};
use nutritionist_provider::{
    ChatCompletionsClient, ProviderConfig, API_KEY_ENV, BASE_URL_ENV, MODEL_ENV, TIMEOUT_ENV,
};
use serde_json::Value;
use time::{Date, OffsetDateTime};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "nk")]
#[command(about = "Nutritionist recommendation CLI")]
struct Cli {
    #[arg(long, default_value = "./nutritionist.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Menu {
        #[command(subcommand)]
        command: MenuCommand,
    },
    Stock {
        #[command(subcommand)]
        command: StockCommand,
    },
    Order {
        #[command(subcommand)]
        command: OrderCommand,
    },
    /// Arm (or with --clear, disarm) the nutritionist reset flag for a date.
    ResetFlag(ResetFlagArgs),
    Recommend(RecommendArgs),
    Track(TrackArgs),
    /// Tracked employees whose order for the date is still unpaid.
    NotifyList(DateArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum MenuCommand {
    AddItem(AddItemArgs),
    List,
    SetDaily(SetDailyArgs),
    Show(DateArgs),
}

#[derive(Debug, Args)]
struct AddItemArgs {
    #[arg(long)]
    name: String,
    /// Price in rupiah.
    #[arg(long)]
    price: i64,
}

#[derive(Debug, Args)]
struct SetDailyArgs {
    #[command(flatten)]
    date: DateArgs,
    /// Menu item id, repeated in canonical order.
    #[arg(long = "item", required = true)]
    items: Vec<i64>,
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Calendar date as YYYY-MM-DD. Defaults to today (UTC).
    #[arg(long, value_parser = parse_date_arg)]
    date: Option<Date>,
}

#[derive(Debug, Subcommand)]
enum StockCommand {
    Mark(StockArgs),
    Unmark(StockArgs),
}

#[derive(Debug, Args)]
struct StockArgs {
    #[arg(long)]
    employee: i64,
    #[arg(long)]
    item: i64,
    #[command(flatten)]
    date: DateArgs,
}

#[derive(Debug, Subcommand)]
enum OrderCommand {
    Record(RecordOrderArgs),
    Pay(PayOrderArgs),
}

#[derive(Debug, Args)]
struct RecordOrderArgs {
    #[arg(long)]
    employee: i64,
    #[command(flatten)]
    date: DateArgs,
}

#[derive(Debug, Args)]
struct PayOrderArgs {
    #[arg(long)]
    order: i64,
}

#[derive(Debug, Args)]
struct ResetFlagArgs {
    #[command(flatten)]
    date: DateArgs,
    #[arg(long, default_value_t = false)]
    clear: bool,
}

#[derive(Debug, Args)]
struct RecommendArgs {
    #[arg(long)]
    employee: i64,
    #[command(flatten)]
    date: DateArgs,
    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Debug, Args)]
struct ProviderArgs {
    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = MODEL_ENV)]
    model: Option<String>,
    #[arg(long, env = BASE_URL_ENV)]
    base_url: Option<String>,
    #[arg(long, env = TIMEOUT_ENV)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Args)]
struct TrackArgs {
    #[arg(long)]
    employee: i64,
    #[arg(long)]
    order: Option<i64>,
    #[command(flatten)]
    date: DateArgs,
}

fn parse_date_arg(value: &str) -> Result<Date, String> {
    parse_date(value).map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

impl DateArgs {
    fn resolve(&self) -> Date {
        self.date.unwrap_or_else(|| OffsetDateTime::now_utc().date())
    }
}

impl ProviderArgs {
    fn config(&self) -> Result<ProviderConfig> {
        let timeout = self.timeout_secs.map(|seconds| seconds.to_string());
        ProviderConfig::from_lookup(|name| match name {
            API_KEY_ENV => self.api_key.clone(),
            MODEL_ENV => self.model.clone(),
            BASE_URL_ENV => self.base_url.clone(),
            TIMEOUT_ENV => timeout.clone(),
            _ => None,
        })
        .context("failed to configure recommendation backend")
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "opening nutritionist database");
    let api = NutritionistApi::new(cli.db);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Menu { command } => run_menu(command, &api),
        Command::Stock { command } => run_stock(command, &api),
        Command::Order { command } => run_order(command, &api),
        Command::ResetFlag(args) => {
            let result = api.set_reset_flag(args.date.resolve(), !args.clear)?;
            emit_json(serde_json::to_value(result)?)
        }
        Command::Recommend(args) => run_recommend(&args, api),
        Command::Track(args) => {
            let selection = api.track_user_selection(
                EmployeeId(args.employee),
                args.date.resolve(),
                args.order.map(OrderId),
            )?;
            emit_json(serde_json::to_value(selection)?)
        }
        Command::NotifyList(args) => {
            let date = args.resolve();
            let users = api.users_needing_notification(date)?;
            emit_json(serde_json::json!({
                "date": format_date(date),
                "users": users,
            }))
        }
    }
}

fn run_db(command: DbCommand, api: &NutritionistApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
    }
}

fn run_menu(command: MenuCommand, api: &NutritionistApi) -> Result<()> {
    match command {
        MenuCommand::AddItem(args) => {
            emit_json(serde_json::to_value(api.add_menu_item(&args.name, args.price)?)?)
        }
        MenuCommand::List => emit_json(serde_json::json!({ "items": api.list_menu_items()? })),
        MenuCommand::SetDaily(args) => {
            let ids = args.items.into_iter().map(MenuItemId).collect::<Vec<_>>();
            emit_json(serde_json::to_value(api.set_daily_menu(args.date.resolve(), &ids)?)?)
        }
        MenuCommand::Show(args) => {
            let date = args.resolve();
            emit_json(serde_json::json!({
                "date": format_date(date),
                "items": api.daily_menu(date)?,
            }))
        }
    }
}

fn run_stock(command: StockCommand, api: &NutritionistApi) -> Result<()> {
    let result = match command {
        StockCommand::Mark(args) => api.mark_stock_empty(
            EmployeeId(args.employee),
            args.date.resolve(),
            MenuItemId(args.item),
        )?,
        StockCommand::Unmark(args) => api.unmark_stock_empty(
            EmployeeId(args.employee),
            args.date.resolve(),
            MenuItemId(args.item),
        )?,
    };
    emit_json(serde_json::to_value(result)?)
}

fn run_order(command: OrderCommand, api: &NutritionistApi) -> Result<()> {
    let result = match command {
        OrderCommand::Record(args) => {
            api.record_order(EmployeeId(args.employee), args.date.resolve())?
        }
        OrderCommand::Pay(args) => api.mark_order_paid(OrderId(args.order))?,
    };
    emit_json(serde_json::to_value(result)?)
}

fn run_recommend(args: &RecommendArgs, api: NutritionistApi) -> Result<()> {
    let client = ChatCompletionsClient::new(args.provider.config()?);
    debug!(model = %client.config().model, "using chat completions backend");
    let api = api.with_generator(Arc::new(client));
    let recommendation = api.recommend(args.date.resolve(), EmployeeId(args.employee))?;
    emit_json(serde_json::to_value(recommendation)?)
}
