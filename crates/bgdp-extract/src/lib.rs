//! Listing-page discovery, typed detail payloads and record extraction.

use bgdp_core::{GameRecord, LIST_SEPARATOR};
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "bgdp-extract";

/// Link-type tag carrying mechanic values in the detail payload.
pub const LINK_TYPE_MECHANIC: &str = "boardgamemechanic";
/// Link-type tag carrying category values in the detail payload.
pub const LINK_TYPE_CATEGORY: &str = "boardgamecategory";
/// The generic overall rank, excluded from the game-type list.
pub const OVERALL_RANK_NAME: &str = "boardgame";
/// Poll carrying the community best-player-count votes.
pub const NUMPLAYERS_POLL: &str = "suggested_numplayers";

// ---------------------------------------------------------------------------
// Identifier discovery
// ---------------------------------------------------------------------------

/// Pulls candidate game identifiers out of a catalog listing page, in page
/// order, duplicates kept. An unexpected page shape yields an empty vec;
/// the orchestrator treats that as fatal misconfiguration.
pub fn discover_game_ids(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("tr[id^='row_'] a.primary") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|anchor| anchor.value().attr("href"))
        // hrefs look like `/boardgame/<id>/<slug>`; the id is the second
        // path segment.
        .filter_map(|href| href.split('/').nth(2))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Detail payload model
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("response body is not XML")]
    NotXml,
    #[error("malformed XML payload: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("malformed XML structure: {0}")]
    Read(#[from] quick_xml::Error),
    #[error("unexpected root element <{0}>")]
    UnexpectedRoot(String),
}

/// The detail endpoint answers with either a container of items or a
/// `<message>` sentinel meaning the request is queued upstream.
#[derive(Debug)]
pub enum ApiResponse {
    Items(Vec<RawItem>),
    Busy(String),
}

#[derive(Debug, Deserialize)]
struct ItemsDoc {
    #[serde(rename = "item", default)]
    items: Vec<RawItem>,
}

/// One entity as returned by the detail endpoint. Every sub-structure is
/// optional: a missing statistics or poll block degrades to empty derived
/// fields, never an error.
#[derive(Debug, Clone, Deserialize)]
pub struct RawItem {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "name", default)]
    pub names: Vec<NameEntry>,
    #[serde(default)]
    pub yearpublished: Option<ValueAttr>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub playingtime: Option<ValueAttr>,
    #[serde(default)]
    pub minplaytime: Option<ValueAttr>,
    #[serde(default)]
    pub maxplaytime: Option<ValueAttr>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(rename = "link", default)]
    pub links: Vec<TypedLink>,
    #[serde(rename = "poll", default)]
    pub polls: Vec<Poll>,
    #[serde(default)]
    pub statistics: Option<Statistics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameEntry {
    #[serde(rename = "@type")]
    pub name_type: String,
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValueAttr {
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypedLink {
    #[serde(rename = "@type")]
    pub link_type: String,
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Poll {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "results", default)]
    pub results: Vec<PollResults>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollResults {
    #[serde(rename = "@numplayers", default)]
    pub numplayers: Option<String>,
    #[serde(rename = "result", default)]
    pub results: Vec<PollResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollResult {
    #[serde(rename = "@value")]
    pub value: String,
    #[serde(rename = "@numvotes", default)]
    pub numvotes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statistics {
    #[serde(default)]
    pub ratings: Option<Ratings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ratings {
    #[serde(default)]
    pub ranks: Option<Ranks>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ranks {
    #[serde(rename = "rank", default)]
    pub ranks: Vec<RankEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankEntry {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@friendlyname", default)]
    pub friendlyname: Option<String>,
}

/// Validates and parses one detail response body. Non-XML bodies fail
/// fast; the busy sentinel is surfaced as flow control, not an error.
pub fn parse_response(body: &str) -> Result<ApiResponse, PayloadError> {
    let trimmed = body.trim_start_matches('\u{feff}').trim_start();
    if !trimmed.starts_with('<') {
        return Err(PayloadError::NotXml);
    }

    match sniff_root(trimmed)? {
        RootKind::Items => {
            let doc: ItemsDoc = quick_xml::de::from_str(trimmed)?;
            Ok(ApiResponse::Items(doc.items))
        }
        RootKind::Message(text) => Ok(ApiResponse::Busy(text)),
        RootKind::Other(name) => Err(PayloadError::UnexpectedRoot(name)),
    }
}

enum RootKind {
    Items,
    Message(String),
    Other(String),
}

fn sniff_root(body: &str) -> Result<RootKind, PayloadError> {
    let mut reader = Reader::from_str(body);
    loop {
        match reader.read_event()? {
            Event::Start(start) | Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                return match name.as_str() {
                    "items" => Ok(RootKind::Items),
                    "message" => {
                        let text = match reader.read_event()? {
                            Event::Text(text) => text
                                .unescape()
                                .map(|t| t.trim().to_string())
                                .unwrap_or_default(),
                            _ => String::new(),
                        };
                        Ok(RootKind::Message(text))
                    }
                    _ => Ok(RootKind::Other(name)),
                };
            }
            Event::Eof => return Err(PayloadError::NotXml),
            _ => continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Text normalizer
// ---------------------------------------------------------------------------

/// Marker substrings that point at UTF-8 text mistakenly decoded as
/// Latin-1. A cheap heuristic, not an encoding detector; it can misfire
/// on legitimate text containing these, which is why the repair step is
/// disableable.
const MOJIBAKE_MARKERS: [&str; 7] = ["Ã", "â", "€", "¢", "œ", "‚", "„"];

/// Free-text repair pipeline: entity decoding, optional mojibake repair,
/// control stripping and whitespace collapsing. Total and idempotent;
/// empty input maps to an empty string.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub repair_mojibake: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            repair_mojibake: true,
        }
    }
}

impl Normalizer {
    pub fn normalize(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let mut text = html_escape::decode_html_entities(text).into_owned();
        if self.repair_mojibake {
            text = repair_mojibake(&text);
        }
        // The upstream double-escapes newlines, so the literal entity can
        // survive one decoding pass.
        let text = text.replace("&#10;", "\n").replace('\r', "");
        let text = text.trim_matches(is_control_char);
        collapse_whitespace(text)
    }

    pub fn normalize_opt(&self, text: Option<&str>) -> String {
        text.map(|t| self.normalize(t)).unwrap_or_default()
    }
}

/// [`Normalizer`] with the default (repairing) configuration.
pub fn normalize(text: &str) -> String {
    Normalizer::default().normalize(text)
}

fn repair_mojibake(text: &str) -> String {
    if !MOJIBAKE_MARKERS.iter().any(|marker| text.contains(marker)) {
        return text.to_string();
    }
    // Latin-1 round trip: only possible when every scalar fits one byte.
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let cp = ch as u32;
        if cp > 0xFF {
            return text.to_string();
        }
        bytes.push(cp as u8);
    }
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_string())
}

fn is_control_char(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1F | 0x7F..=0x9F)
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
                prev_space = true;
            }
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

// ---------------------------------------------------------------------------
// Record extractor
// ---------------------------------------------------------------------------

/// Pure extraction policy. The year cutoff scopes the dataset; the
/// description profile additionally populates and normalizes the
/// free-text columns.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub publication_year_cutoff: Option<i32>,
    pub with_descriptions: bool,
    pub normalizer: Normalizer,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            publication_year_cutoff: Some(2021),
            with_descriptions: false,
            normalizer: Normalizer::default(),
        }
    }
}

/// Maps raw payload items to flat records. Items published after the
/// cutoff are dropped; items without a publication year are kept.
pub fn extract_records(items: &[RawItem], options: &ExtractOptions) -> Vec<GameRecord> {
    items
        .iter()
        .filter(|item| !past_cutoff(item, options.publication_year_cutoff))
        .map(|item| extract_one(item, options))
        .collect()
}

fn past_cutoff(item: &RawItem, cutoff: Option<i32>) -> bool {
    let Some(cutoff) = cutoff else {
        return false;
    };
    item.yearpublished
        .as_ref()
        .and_then(|year| year.value.parse::<i32>().ok())
        .map(|year| year > cutoff)
        .unwrap_or(false)
}

fn extract_one(item: &RawItem, options: &ExtractOptions) -> GameRecord {
    let mut record = GameRecord::new(item.id.clone());

    record.mechanics = joined_or_none(typed_link_values(item, LINK_TYPE_MECHANIC));
    record.category = joined_or_none(typed_link_values(item, LINK_TYPE_CATEGORY));
    record.gametype = joined_or_none(game_types(item));
    record.best_numplayers = best_player_count(item);
    record.playingtime = item.playingtime.as_ref().map(|v| v.value.clone());
    record.minplaytime = item.minplaytime.as_ref().map(|v| v.value.clone());
    record.maxplaytime = item.maxplaytime.as_ref().map(|v| v.value.clone());
    record.image = item.image.clone();
    record.thumbnail = item.thumbnail.clone();

    if options.with_descriptions {
        record.name = primary_name(item).map(|name| options.normalizer.normalize(name));
        let description = options
            .normalizer
            .normalize_opt(item.description.as_deref());
        record.description = Some(description);
    }

    record
}

/// First name entry tagged `primary`, if any.
pub fn primary_name(item: &RawItem) -> Option<&str> {
    item.names
        .iter()
        .find(|name| name.name_type == "primary")
        .map(|name| name.value.as_str())
}

pub fn typed_link_values(item: &RawItem, link_type: &str) -> Vec<String> {
    item.links
        .iter()
        .filter(|link| link.link_type == link_type)
        .map(|link| link.value.clone())
        .collect()
}

/// Every rank except the generic overall one, with the ` Rank` suffix
/// stripped from its display label.
pub fn game_types(item: &RawItem) -> Vec<String> {
    let Some(ranks) = item
        .statistics
        .as_ref()
        .and_then(|stats| stats.ratings.as_ref())
        .and_then(|ratings| ratings.ranks.as_ref())
    else {
        return Vec::new();
    };
    ranks
        .ranks
        .iter()
        .filter(|rank| rank.name != OVERALL_RANK_NAME)
        .filter_map(|rank| rank.friendlyname.as_deref())
        .map(|label| label.strip_suffix(" Rank").unwrap_or(label).to_string())
        .collect()
}

/// Vote-weighted best player count over the numplayers poll: rows with a
/// numeric player count contribute `count * votes(Best)`; rows keyed
/// `Unknown` (or any non-numeric key) are skipped. `None` when no votes
/// were counted.
pub fn best_player_count(item: &RawItem) -> Option<f64> {
    let poll = item.polls.iter().find(|poll| poll.name == NUMPLAYERS_POLL)?;

    let mut total_votes: u64 = 0;
    let mut weighted_sum: u64 = 0;
    for row in &poll.results {
        let Some(numplayers) = row
            .numplayers
            .as_deref()
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        let Some(best) = row.results.iter().find(|result| result.value == "Best") else {
            continue;
        };
        let votes = best
            .numvotes
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        total_votes += votes;
        weighted_sum += numplayers * votes;
    }

    if total_votes == 0 {
        return None;
    }
    Some(round2(weighted_sum as f64 / total_votes as f64))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn joined_or_none(values: Vec<String>) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(values.join(LIST_SEPARATOR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_PAGE: &str = r#"
        <html><body><table>
          <tr id="row_1">
            <td><a class="primary" href="/boardgame/174430/gloomhaven">Gloomhaven</a></td>
          </tr>
          <tr id="row_2">
            <td><a class="primary" href="/boardgame/822/carcassonne">Carcassonne</a></td>
          </tr>
          <tr id="row_3">
            <td><a class="primary" href="/boardgame/822/carcassonne">Carcassonne</a></td>
          </tr>
          <tr id="other"><td><a class="primary" href="/boardgame/999/nope">skipped</a></td></tr>
        </table></body></html>"#;

    const ITEM_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <items termsofuse="https://example.invalid/xmlapi/termsofuse">
          <item type="boardgame" id="822">
            <thumbnail>https://cf.example/thumb.jpg</thumbnail>
            <image>https://cf.example/image.jpg</image>
            <name type="primary" sortindex="1" value="Carcassonne"/>
            <name type="alternate" sortindex="1" value="Carcassonne Junior"/>
            <description>The game of&amp;#10;laying tiles.</description>
            <yearpublished value="2000"/>
            <playingtime value="45"/>
            <minplaytime value="30"/>
            <maxplaytime value="45"/>
            <link type="boardgamecategory" id="1029" value="City Building"/>
            <link type="boardgamecategory" id="1035" value="Medieval"/>
            <link type="boardgamemechanic" id="2002" value="Tile Placement"/>
            <link type="boardgamedesigner" id="398" value="Klaus-Jürgen Wrede"/>
            <poll name="suggested_numplayers" title="User Suggested Number of Players" totalvotes="18">
              <results numplayers="2">
                <result value="Best" numvotes="5"/>
                <result value="Recommended" numvotes="2"/>
              </results>
              <results numplayers="3">
                <result value="Best" numvotes="3"/>
              </results>
              <results numplayers="4+">
                <result value="Best" numvotes="10"/>
              </results>
            </poll>
            <statistics page="1">
              <ratings>
                <average value="7.42"/>
                <ranks>
                  <rank type="subtype" id="1" name="boardgame" friendlyname="Board Game Rank" value="201"/>
                  <rank type="family" id="5499" name="familygames" friendlyname="Family Game Rank" value="50"/>
                  <rank type="family" id="5497" name="strategygames" friendlyname="Strategy Game Rank" value="120"/>
                </ranks>
              </ratings>
            </statistics>
          </item>
          <item type="boardgame" id="999999">
            <name type="primary" sortindex="1" value="Too New"/>
            <yearpublished value="2024"/>
          </item>
          <item type="boardgame" id="31"/>
        </items>"#;

    fn parsed_items() -> Vec<RawItem> {
        match parse_response(ITEM_XML).expect("parse") {
            ApiResponse::Items(items) => items,
            ApiResponse::Busy(_) => panic!("unexpected busy sentinel"),
        }
    }

    #[test]
    fn discovery_keeps_page_order_and_duplicates() {
        let ids = discover_game_ids(LISTING_PAGE);
        assert_eq!(ids, vec!["174430", "822", "822"]);
    }

    #[test]
    fn discovery_of_unexpected_page_shape_is_empty() {
        assert!(discover_game_ids("<html><body><p>maintenance</p></body></html>").is_empty());
    }

    #[test]
    fn non_xml_body_is_rejected_immediately() {
        assert!(matches!(
            parse_response("<!DOCTYPE html>...").err(),
            Some(PayloadError::NotXml) | Some(PayloadError::UnexpectedRoot(_))
        ));
        assert!(matches!(
            parse_response("Bad Gateway").err(),
            Some(PayloadError::NotXml)
        ));
        assert!(matches!(parse_response("").err(), Some(PayloadError::NotXml)));
    }

    #[test]
    fn busy_sentinel_is_flow_control_not_an_error() {
        let body = "<message>Your request has been accepted and will be processed.</message>";
        match parse_response(body).expect("parse") {
            ApiResponse::Busy(text) => assert!(text.contains("accepted")),
            ApiResponse::Items(_) => panic!("expected busy sentinel"),
        }
    }

    #[test]
    fn best_player_count_is_vote_weighted_and_skips_non_numeric_rows() {
        let items = parsed_items();
        // (2*5 + 3*3) / (5+3) = 2.375 -> 2.38; the "4+" row contributes
        // nothing despite its ten votes.
        assert_eq!(best_player_count(&items[0]), Some(2.38));
    }

    #[test]
    fn missing_poll_or_statistics_degrade_to_none() {
        let items = parsed_items();
        let bare = &items[2];
        assert_eq!(best_player_count(bare), None);
        assert!(game_types(bare).is_empty());
        assert_eq!(primary_name(bare), None);
    }

    #[test]
    fn game_types_drop_overall_rank_and_suffix() {
        let items = parsed_items();
        assert_eq!(game_types(&items[0]), vec!["Family Game", "Strategy Game"]);
    }

    #[test]
    fn year_cutoff_excludes_new_items_and_keeps_undated_ones() {
        let items = parsed_items();
        let records = extract_records(&items, &ExtractOptions::default());
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["822", "31"], "2024 item filtered, undated item kept");
    }

    #[test]
    fn catalog_profile_leaves_free_text_columns_unset() {
        let items = parsed_items();
        let records = extract_records(&items, &ExtractOptions::default());
        assert_eq!(records[0].name, None);
        assert_eq!(records[0].description, None);
        assert_eq!(
            records[0].mechanics.as_deref(),
            Some("Tile Placement"),
            "designer links must not leak into mechanics"
        );
        assert_eq!(
            records[0].category.as_deref(),
            Some("City Building; Medieval")
        );
        assert_eq!(records[0].playingtime.as_deref(), Some("45"));
        assert_eq!(records[0].image.as_deref(), Some("https://cf.example/image.jpg"));
    }

    #[test]
    fn description_profile_populates_and_normalizes_free_text() {
        let items = parsed_items();
        let options = ExtractOptions {
            with_descriptions: true,
            ..ExtractOptions::default()
        };
        let records = extract_records(&items, &options);
        assert_eq!(records[0].name.as_deref(), Some("Carcassonne"));
        // `&amp;#10;` decodes to the literal entity, which the normalizer
        // converts to whitespace.
        assert_eq!(
            records[0].description.as_deref(),
            Some("The game of laying tiles.")
        );
    }

    #[test]
    fn normalize_is_total_and_idempotent() {
        assert_eq!(normalize(""), "");
        assert_eq!(Normalizer::default().normalize_opt(None), "");

        let samples = [
            "  A &amp; B \u{1} game&#10;with   lines \r\n",
            "CafÃ© International",
            "plain text",
            "tabs\tand\nnewlines",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "normalize must be idempotent: {sample:?}");
        }
    }

    #[test]
    fn normalize_decodes_entities_and_strips_controls() {
        assert_eq!(
            normalize("\u{2}\u{3}Dungeons &amp; Dragons&#10;&#10;rules \u{7f}"),
            "Dungeons & Dragons rules"
        );
    }

    #[test]
    fn normalize_repairs_marked_mojibake_only() {
        assert_eq!(normalize("CafÃ© International"), "Café International");
        // No marker, nothing rewritten.
        assert_eq!(normalize("Café International"), "Café International");
        // Marker present but not Latin-1 encodable: left alone.
        assert_eq!(normalize("â 中文"), "â 中文");
    }

    #[test]
    fn normalize_repair_can_be_disabled() {
        let normalizer = Normalizer {
            repair_mojibake: false,
        };
        assert_eq!(normalizer.normalize("CafÃ© International"), "CafÃ© International");
    }

    #[test]
    fn whitespace_runs_collapse_to_single_spaces() {
        assert_eq!(normalize("a  b\n\n c\t\td"), "a b c d");
    }
}
