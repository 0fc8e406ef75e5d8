//! Endpoint classes of the Steam Web and Store APIs.
//!
//! An endpoint class is a logical category of upstream operation. All calls
//! in one class share a cache TTL policy, a circuit breaker and a rate-limit
//! scope.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{HeimdallError, Result};

/// Which upstream host serves an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Host {
    /// `api.steampowered.com`
    Api,
    /// `store.steampowered.com`
    Store,
}

/// Shape a parameter value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// 64-bit community id, exactly 17 digits.
    SteamId,
    /// Numeric application id.
    AppId,
    /// Small positive count (1..=100).
    Count,
}

impl ParamKind {
    pub fn check(self, name: &str, value: &str) -> Result<()> {
        let digits = !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit());
        let ok = match self {
            ParamKind::SteamId => digits && value.len() == 17,
            ParamKind::AppId => digits,
            ParamKind::Count => digits && value.parse::<u32>().is_ok_and(|n| (1..=100).contains(&n)),
        };
        if ok {
            Ok(())
        } else {
            Err(HeimdallError::InvalidInput(format!(
                "parameter '{name}' has invalid value '{value}' (expected {self:?})"
            )))
        }
    }
}

/// Declared parameter of an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

const fn required(name: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        kind,
        required: false,
    }
}

const PROFILE_PARAMS: &[ParamSpec] = &[required("steamids", ParamKind::SteamId)];
const STEAM_ID_PARAMS: &[ParamSpec] = &[required("steamid", ParamKind::SteamId)];
const RECENT_GAMES_PARAMS: &[ParamSpec] = &[
    required("steamid", ParamKind::SteamId),
    optional("count", ParamKind::Count),
];
const ACHIEVEMENTS_PARAMS: &[ParamSpec] = &[
    required("steamid", ParamKind::SteamId),
    required("appid", ParamKind::AppId),
];
const APP_ID_PARAMS: &[ParamSpec] = &[required("appid", ParamKind::AppId)];
const NEWS_PARAMS: &[ParamSpec] = &[
    required("appid", ParamKind::AppId),
    optional("count", ParamKind::Count),
];
const GAME_DETAILS_PARAMS: &[ParamSpec] = &[required("appids", ParamKind::AppId)];

/// A logical category of upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Player summary (persona, avatar, status).
    Profile,
    /// Owned games with app info and playtime.
    OwnedGames,
    /// Recently played games.
    RecentGames,
    /// A player's achievements for one game.
    Achievements,
    /// Achievement and stat schema of a game.
    GameSchema,
    /// Current number of players in a game.
    PlayerCount,
    /// Latest news items for a game.
    News,
    /// Friend list.
    Friends,
    /// Badges earned by a player.
    Badges,
    /// Steam level of a player.
    PlayerLevel,
    /// Store page details of a game.
    GameDetails,
    /// Featured games on the store front page.
    Featured,
}

impl EndpointClass {
    /// Every endpoint class, in declaration order.
    pub const ALL: [EndpointClass; 12] = [
        EndpointClass::Profile,
        EndpointClass::OwnedGames,
        EndpointClass::RecentGames,
        EndpointClass::Achievements,
        EndpointClass::GameSchema,
        EndpointClass::PlayerCount,
        EndpointClass::News,
        EndpointClass::Friends,
        EndpointClass::Badges,
        EndpointClass::PlayerLevel,
        EndpointClass::GameDetails,
        EndpointClass::Featured,
    ];

    /// Stable snake_case name, used in config keys, cache keys and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Profile => "profile",
            EndpointClass::OwnedGames => "owned_games",
            EndpointClass::RecentGames => "recent_games",
            EndpointClass::Achievements => "achievements",
            EndpointClass::GameSchema => "game_schema",
            EndpointClass::PlayerCount => "player_count",
            EndpointClass::News => "news",
            EndpointClass::Friends => "friends",
            EndpointClass::Badges => "badges",
            EndpointClass::PlayerLevel => "player_level",
            EndpointClass::GameDetails => "game_details",
            EndpointClass::Featured => "featured",
        }
    }

    pub fn host(self) -> Host {
        match self {
            EndpointClass::GameDetails | EndpointClass::Featured => Host::Store,
            _ => Host::Api,
        }
    }

    /// Path on the endpoint's host, without leading slash.
    pub fn path(self) -> &'static str {
        match self {
            EndpointClass::Profile => "ISteamUser/GetPlayerSummaries/v2/",
            EndpointClass::OwnedGames => "IPlayerService/GetOwnedGames/v1/",
            EndpointClass::RecentGames => "IPlayerService/GetRecentlyPlayedGames/v1/",
            EndpointClass::Achievements => "ISteamUserStats/GetPlayerAchievements/v1/",
            EndpointClass::GameSchema => "ISteamUserStats/GetSchemaForGame/v2/",
            EndpointClass::PlayerCount => "ISteamUserStats/GetNumberOfCurrentPlayers/v1/",
            EndpointClass::News => "ISteamNews/GetNewsForApp/v2/",
            EndpointClass::Friends => "ISteamUser/GetFriendList/v1/",
            EndpointClass::Badges => "IPlayerService/GetBadges/v1/",
            EndpointClass::PlayerLevel => "IPlayerService/GetSteamLevel/v1/",
            EndpointClass::GameDetails => "api/appdetails",
            EndpointClass::Featured => "api/featured",
        }
    }

    /// Parameters the caller may (or must) supply.
    pub fn params(self) -> &'static [ParamSpec] {
        match self {
            EndpointClass::Profile => PROFILE_PARAMS,
            EndpointClass::OwnedGames
            | EndpointClass::Friends
            | EndpointClass::Badges
            | EndpointClass::PlayerLevel => STEAM_ID_PARAMS,
            EndpointClass::RecentGames => RECENT_GAMES_PARAMS,
            EndpointClass::Achievements => ACHIEVEMENTS_PARAMS,
            EndpointClass::GameSchema | EndpointClass::PlayerCount => APP_ID_PARAMS,
            EndpointClass::News => NEWS_PARAMS,
            EndpointClass::GameDetails => GAME_DETAILS_PARAMS,
            EndpointClass::Featured => &[],
        }
    }

    /// Query parameters always sent, independent of the caller.
    pub fn fixed_query(self) -> &'static [(&'static str, &'static str)] {
        match self {
            EndpointClass::OwnedGames => &[("include_appinfo", "1"), ("include_played_free_games", "1")],
            EndpointClass::Friends => &[("relationship", "friend")],
            EndpointClass::News => &[("maxlength", "300")],
            _ => &[],
        }
    }

    /// Whether the upstream requires the API key on this endpoint.
    pub fn requires_key(self) -> bool {
        !matches!(
            self,
            EndpointClass::PlayerCount
                | EndpointClass::News
                | EndpointClass::GameDetails
                | EndpointClass::Featured
        )
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointClass {
    type Err = HeimdallError;

    fn from_str(s: &str) -> Result<Self> {
        EndpointClass::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| HeimdallError::InvalidInput(format!("unknown endpoint class '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for endpoint in EndpointClass::ALL {
            assert_eq!(endpoint.as_str().parse::<EndpointClass>().unwrap(), endpoint);
        }
    }

    #[test]
    fn unknown_name_is_invalid_input() {
        let err = "wishlist".parse::<EndpointClass>().unwrap_err();
        assert!(matches!(err, HeimdallError::InvalidInput(_)));
    }

    #[test]
    fn steam_id_must_be_seventeen_digits() {
        assert!(ParamKind::SteamId.check("steamid", "76561197960435530").is_ok());
        assert!(ParamKind::SteamId.check("steamid", "7656119796043553").is_err());
        assert!(ParamKind::SteamId.check("steamid", "7656119796043553x").is_err());
        assert!(ParamKind::SteamId.check("steamid", "").is_err());
    }

    #[test]
    fn count_is_bounded() {
        assert!(ParamKind::Count.check("count", "5").is_ok());
        assert!(ParamKind::Count.check("count", "0").is_err());
        assert!(ParamKind::Count.check("count", "101").is_err());
    }

    #[test]
    fn declared_params_per_endpoint() {
        let names = |endpoint: EndpointClass| -> Vec<(&str, bool)> {
            endpoint.params().iter().map(|p| (p.name, p.required)).collect()
        };
        assert_eq!(names(EndpointClass::Profile), vec![("steamids", true)]);
        assert_eq!(names(EndpointClass::Badges), vec![("steamid", true)]);
        assert_eq!(
            names(EndpointClass::RecentGames),
            vec![("steamid", true), ("count", false)]
        );
        assert_eq!(
            names(EndpointClass::Achievements),
            vec![("steamid", true), ("appid", true)]
        );
        assert_eq!(names(EndpointClass::News), vec![("appid", true), ("count", false)]);
        assert_eq!(names(EndpointClass::GameDetails), vec![("appids", true)]);
        assert!(names(EndpointClass::Featured).is_empty());
        for endpoint in EndpointClass::ALL {
            let required = endpoint.params().iter().filter(|p| p.required).count();
            assert!(required <= 2, "{endpoint} declares {required} required params");
        }
    }

    #[test]
    fn store_endpoints_use_store_host() {
        assert_eq!(EndpointClass::GameDetails.host(), Host::Store);
        assert_eq!(EndpointClass::Profile.host(), Host::Api);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&EndpointClass::PlayerCount).unwrap();
        assert_eq!(json, "\"player_count\"");
    }
}
