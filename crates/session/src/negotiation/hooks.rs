// Pluggable parameter negotiation for session joins.
//
// The invitee collects its preferences from every hook, the host lets each
// hook consider them against the running session, and both sides apply the
// host's decision. The negotiation itself never looks inside the maps.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tandem_common::protocol::negotiation::{HookParameters, HookPreferences};
use tandem_common::types::{ColorId, UserId, MAX_COLOR_ID};
use tracing::debug;

use crate::session::Session;

/// How resource content is shipped during a resource negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    /// All files of a group in one message.
    #[default]
    Archive,
    /// One message per file.
    Instant,
}

impl TransferType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Instant => "instant",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "archive" => Ok(Self::Archive),
            "instant" => Ok(Self::Instant),
            other => Err(format!("unknown transfer type '{other}'")),
        }
    }
}

/// Parameters settled by the hooks for one joining participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinParameters {
    pub color: ColorId,
    pub favorite_color: ColorId,
    pub transfer_type: TransferType,
}

impl Default for JoinParameters {
    fn default() -> Self {
        Self {
            color: ColorId::UNDEFINED,
            favorite_color: ColorId::UNDEFINED,
            transfer_type: TransferType::default(),
        }
    }
}

pub trait NegotiationHook: Send + Sync {
    /// Key under which this hook's preferences travel.
    fn identifier(&self) -> &'static str;

    /// Preferences the invitee sends to the host.
    fn tell_client_preferences(&self) -> Option<HookPreferences>;

    /// Host-side defaults, used when the invitee expressed nothing.
    fn tell_host_preferences(&self) -> Option<HookPreferences>;

    /// Decide the parameters for `peer`. Must not mutate the session.
    fn consider_client_preferences(
        &self,
        session: &Session,
        peer: &UserId,
        preferences: Option<&HookPreferences>,
    ) -> Option<HookPreferences>;

    fn apply_actual_parameters(&self, settings: &HookPreferences, parameters: &mut JoinParameters);
}

pub type Hooks = Vec<Arc<dyn NegotiationHook>>;

pub fn collect_client_preferences(hooks: &[Arc<dyn NegotiationHook>]) -> HookParameters {
    hooks
        .iter()
        .filter_map(|hook| {
            hook.tell_client_preferences().map(|prefs| (hook.identifier().to_string(), prefs))
        })
        .collect()
}

pub fn consider_all(
    hooks: &[Arc<dyn NegotiationHook>],
    session: &Session,
    peer: &UserId,
    client: &HookParameters,
) -> HookParameters {
    hooks
        .iter()
        .filter_map(|hook| {
            let considered =
                hook.consider_client_preferences(session, peer, client.get(hook.identifier()));
            considered.map(|settings| (hook.identifier().to_string(), settings))
        })
        .collect()
}

/// Apply the host's decision. Hooks without settings leave the defaults.
pub fn apply_all(
    hooks: &[Arc<dyn NegotiationHook>],
    settings: &HookParameters,
    parameters: &mut JoinParameters,
) {
    for hook in hooks {
        match settings.get(hook.identifier()) {
            Some(settings) => hook.apply_actual_parameters(settings, parameters),
            None => debug!(hook = hook.identifier(), "no settings for hook"),
        }
    }
}

// ── Color ───────────────────────────────────────────────────────────

const COLOR_KEY: &str = "color";
const FAVORITE_COLOR_KEY: &str = "favorite_color";

/// Hands out highlight colors, honoring the invitee's favorite when free.
pub struct ColorNegotiationHook {
    favorite: ColorId,
}

impl ColorNegotiationHook {
    pub fn new(favorite: ColorId) -> Self {
        Self { favorite }
    }

    fn assign(used: &[ColorId], favorite: ColorId) -> ColorId {
        if favorite.is_valid() && !used.contains(&favorite) {
            return favorite;
        }
        (0..MAX_COLOR_ID)
            .map(ColorId::new)
            .find(|color| !used.contains(color))
            .unwrap_or(ColorId::UNDEFINED)
    }
}

impl NegotiationHook for ColorNegotiationHook {
    fn identifier(&self) -> &'static str {
        "color"
    }

    fn tell_client_preferences(&self) -> Option<HookPreferences> {
        Some(HookPreferences::from([(FAVORITE_COLOR_KEY.to_string(), self.favorite.to_string())]))
    }

    fn tell_host_preferences(&self) -> Option<HookPreferences> {
        None
    }

    fn consider_client_preferences(
        &self,
        session: &Session,
        peer: &UserId,
        preferences: Option<&HookPreferences>,
    ) -> Option<HookPreferences> {
        let favorite = preferences
            .and_then(|prefs| prefs.get(FAVORITE_COLOR_KEY))
            .and_then(|value| ColorId::parse(value))
            .unwrap_or(ColorId::UNDEFINED);
        let used: Vec<ColorId> = session
            .users()
            .into_iter()
            .filter(|user| &user.id != peer)
            .map(|user| user.color)
            .filter(|color| color.is_valid())
            .collect();

        let color = Self::assign(&used, favorite);
        debug!(peer = %peer, favorite = %favorite, color = %color, "assigned color");
        Some(HookPreferences::from([
            (COLOR_KEY.to_string(), color.to_string()),
            (FAVORITE_COLOR_KEY.to_string(), favorite.to_string()),
        ]))
    }

    fn apply_actual_parameters(&self, settings: &HookPreferences, parameters: &mut JoinParameters) {
        if let Some(color) = settings.get(COLOR_KEY).and_then(|value| ColorId::parse(value)) {
            parameters.color = color;
        }
        if let Some(favorite) =
            settings.get(FAVORITE_COLOR_KEY).and_then(|value| ColorId::parse(value))
        {
            parameters.favorite_color = favorite;
        }
    }
}

// ── Transfer type ───────────────────────────────────────────────────

const TRANSFER_TYPE_KEY: &str = "type";

/// Picks the content transfer mode; the invitee's preference wins.
pub struct TransferTypeHook {
    preferred: Option<TransferType>,
}

impl TransferTypeHook {
    pub fn new(preferred: Option<TransferType>) -> Self {
        Self { preferred }
    }

    fn preferences(preferred: Option<TransferType>) -> Option<HookPreferences> {
        preferred.map(|transfer| {
            HookPreferences::from([(TRANSFER_TYPE_KEY.to_string(), transfer.as_str().to_string())])
        })
    }
}

impl NegotiationHook for TransferTypeHook {
    fn identifier(&self) -> &'static str {
        "transfer_type"
    }

    fn tell_client_preferences(&self) -> Option<HookPreferences> {
        Self::preferences(self.preferred)
    }

    fn tell_host_preferences(&self) -> Option<HookPreferences> {
        Self::preferences(self.preferred)
    }

    fn consider_client_preferences(
        &self,
        _session: &Session,
        _peer: &UserId,
        preferences: Option<&HookPreferences>,
    ) -> Option<HookPreferences> {
        let requested = preferences
            .and_then(|prefs| prefs.get(TRANSFER_TYPE_KEY))
            .and_then(|value| value.parse::<TransferType>().ok());
        match requested {
            Some(transfer) => Self::preferences(Some(transfer)),
            None => self.tell_host_preferences(),
        }
    }

    fn apply_actual_parameters(&self, settings: &HookPreferences, parameters: &mut JoinParameters) {
        if let Some(transfer) =
            settings.get(TRANSFER_TYPE_KEY).and_then(|value| value.parse::<TransferType>().ok())
        {
            parameters.transfer_type = transfer;
        }
    }
}

/// Hooks every participant installs unless configured otherwise.
pub fn default_hooks(favorite_color: ColorId, transfer_type: Option<TransferType>) -> Hooks {
    vec![
        Arc::new(ColorNegotiationHook::new(favorite_color)),
        Arc::new(TransferTypeHook::new(transfer_type)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn favorite_color_is_kept_when_free() {
        let used = [ColorId::new(0), ColorId::new(2)];
        assert_eq!(ColorNegotiationHook::assign(&used, ColorId::new(3)), ColorId::new(3));
    }

    #[test]
    fn taken_favorite_falls_back_to_lowest_free() {
        let used = [ColorId::new(0), ColorId::new(1), ColorId::new(3)];
        assert_eq!(ColorNegotiationHook::assign(&used, ColorId::new(3)), ColorId::new(2));
        assert_eq!(ColorNegotiationHook::assign(&used, ColorId::UNDEFINED), ColorId::new(2));
    }

    #[test]
    fn exhausted_palette_yields_undefined() {
        let used: Vec<ColorId> = (0..MAX_COLOR_ID).map(ColorId::new).collect();
        assert_eq!(ColorNegotiationHook::assign(&used, ColorId::new(1)), ColorId::UNDEFINED);
    }

    #[test]
    fn applied_settings_update_join_parameters() {
        let hooks = default_hooks(ColorId::new(1), Some(TransferType::Instant));
        let mut settings = HookParameters::new();
        settings.insert(
            "color".into(),
            HookPreferences::from([
                ("color".to_string(), "4".to_string()),
                ("favorite_color".to_string(), "1".to_string()),
            ]),
        );
        settings.insert(
            "transfer_type".into(),
            HookPreferences::from([("type".to_string(), "instant".to_string())]),
        );

        let mut parameters = JoinParameters::default();
        apply_all(&hooks, &settings, &mut parameters);
        assert_eq!(parameters.color, ColorId::new(4));
        assert_eq!(parameters.favorite_color, ColorId::new(1));
        assert_eq!(parameters.transfer_type, TransferType::Instant);
    }

    #[test]
    fn client_preferences_are_keyed_by_hook() {
        let hooks = default_hooks(ColorId::new(2), None);
        let collected = collect_client_preferences(&hooks);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected["color"]["favorite_color"], "2");
    }

    #[test]
    fn transfer_type_parses_known_values() {
        assert_eq!("instant".parse::<TransferType>(), Ok(TransferType::Instant));
        assert!("zip".parse::<TransferType>().is_err());
    }
}
