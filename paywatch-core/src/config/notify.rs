/// Outgoing notification settings.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    /// HMAC key used to sign merchant webhooks and to verify Service API requests.
    pub api_token: String,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}
