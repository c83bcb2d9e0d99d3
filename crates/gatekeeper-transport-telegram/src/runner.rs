use crate::bot;
use crate::bot::handlers::{get_user_id_safe, Command, Sessions};
use crate::bot::{DenialCache, TelegramGateway};
use crate::config::BotSettings;
use gatekeeper_core::events::SubscriptionEventProcessor;
use gatekeeper_core::gateway::ChannelGateway;
use gatekeeper_core::router::ConversationRouter;
use gatekeeper_core::sheets::google::{GoogleSheetsBackend, ServiceAccountKey};
use gatekeeper_core::sheets::SheetStore;
use gatekeeper_core::workflow::{AccessPolicy, WorkflowContext};
use gatekeeper_runtime::{spawn_backup_scheduler, BackupConfig, BackupScheduler};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, CallbackQuery, ChatJoinRequest, ChatMemberUpdated};
use teloxide::update_listeners::Polling;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the Telegram transport runtime.
pub async fn run_bot(settings: Arc<BotSettings>) {
    let store = init_store(&settings).await;

    let bot = Bot::new(settings.telegram.telegram_bot_token.clone());
    let gateway: Arc<dyn ChannelGateway> = Arc::new(TelegramGateway::new(bot.clone()));
    let access = Arc::new(AccessPolicy::from_settings(&settings.core));
    info!(
        admins = access.admins().len(),
        channels = access.channels().len(),
        "Access policy loaded"
    );

    let ctx = WorkflowContext::new(store.clone(), gateway.clone(), access.clone())
        .with_settings(&settings.core);
    let router = Arc::new(ConversationRouter::new(ctx, settings.core.spreadsheet_url()));
    let sessions = Arc::new(Sessions::new());
    let processor = Arc::new(SubscriptionEventProcessor::new(store.clone()));
    let denials = Arc::new(DenialCache::new(
        settings.telegram.denial_cooldown(),
        settings.telegram.denial_cache_max_size,
    ));

    let shutdown = CancellationToken::new();
    let backups = spawn_backup_scheduler(
        BackupScheduler::new(
            store,
            gateway,
            BackupConfig {
                interval: settings.core.backup_interval(),
                recipients: access.admins(),
            },
        ),
        shutdown.clone(),
    );

    // chat_member and chat_join_request are only delivered when asked for
    let listener = Polling::builder(bot.clone())
        .allowed_updates(vec![
            AllowedUpdate::Message,
            AllowedUpdate::CallbackQuery,
            AllowedUpdate::ChatMember,
            AllowedUpdate::ChatJoinRequest,
        ])
        .build();

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![
            router,
            sessions,
            processor,
            access,
            denials
        ])
        .enable_ctrlc_handler()
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    shutdown.cancel();
    if let Err(e) = backups.await {
        error!("Backup scheduler ended abnormally: {}", e);
    }
    info!("Bot stopped.");
}

async fn init_store(settings: &BotSettings) -> Arc<SheetStore> {
    let key = match ServiceAccountKey::from_file(&settings.core.google_creds_json) {
        Ok(key) => key,
        Err(e) => {
            error!("Failed to load service account credentials: {}", e);
            std::process::exit(1);
        }
    };
    let backend = match GoogleSheetsBackend::new(settings.core.spreadsheet_id.clone(), key) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            error!("Failed to initialize Google Sheets backend: {}", e);
            std::process::exit(1);
        }
    };

    let store = SheetStore::from_settings(backend, &settings.core);
    match store.ensure_all().await {
        Ok(()) => info!("Spreadsheet schema verified."),
        Err(e) => {
            error!("Failed to prepare spreadsheet tables: {}", e);
            std::process::exit(1);
        }
    }
    Arc::new(store)
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_chat_member()
                .filter(|u: ChatMemberUpdated, access: Arc<AccessPolicy>| access.manages(u.chat.id.0))
                .endpoint(on_member_update),
        )
        .branch(
            Update::filter_chat_join_request()
                .filter(|r: ChatJoinRequest, access: Arc<AccessPolicy>| access.manages(r.chat.id.0))
                .endpoint(on_join_request),
        )
        .branch(
            Update::filter_callback_query()
                .branch(
                    dptree::filter(|q: CallbackQuery, access: Arc<AccessPolicy>| {
                        access.is_admin(q.from.id.0.cast_signed())
                    })
                    .endpoint(on_callback),
                )
                .branch(dptree::endpoint(on_unauthorized_callback)),
        )
        .branch(
            Update::filter_message()
                .filter(|msg: Message| msg.chat.is_private())
                .branch(
                    dptree::filter(|msg: Message, access: Arc<AccessPolicy>| {
                        access.is_admin(get_user_id_safe(&msg))
                    })
                    .branch(
                        dptree::entry()
                            .filter_command::<Command>()
                            .endpoint(on_command),
                    )
                    .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(on_text)),
                )
                // Everyone not matched above is unauthorized
                .branch(dptree::endpoint(on_unauthorized)),
        )
}

async fn on_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    router: Arc<ConversationRouter>,
    sessions: Arc<Sessions>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_command(bot, msg, cmd, router, sessions).await {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn on_text(
    bot: Bot,
    msg: Message,
    router: Arc<ConversationRouter>,
    sessions: Arc<Sessions>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_text(bot, msg, router, sessions).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}

async fn on_callback(
    bot: Bot,
    q: CallbackQuery,
    router: Arc<ConversationRouter>,
    sessions: Arc<Sessions>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_callback(bot, q, router, sessions).await {
        error!("Callback handler error: {}", e);
    }
    respond(())
}

async fn on_unauthorized(
    bot: Bot,
    msg: Message,
    denials: Arc<DenialCache>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_unauthorized(bot, msg, denials).await {
        error!("Failed to send access denied message: {}", e);
    }
    respond(())
}

async fn on_unauthorized_callback(bot: Bot, q: CallbackQuery) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_unauthorized_callback(bot, q).await {
        error!("Failed to answer unauthorized callback: {}", e);
    }
    respond(())
}

async fn on_member_update(
    update: ChatMemberUpdated,
    processor: Arc<SubscriptionEventProcessor>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_member_update(update, processor).await {
        error!("Membership update error: {}", e);
    }
    respond(())
}

async fn on_join_request(
    request: ChatJoinRequest,
    processor: Arc<SubscriptionEventProcessor>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::handle_join_request(request, processor).await {
        error!("Join request error: {}", e);
    }
    respond(())
}
