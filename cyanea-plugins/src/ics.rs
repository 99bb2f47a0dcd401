//! The `ics` plugin: publishes every event as one iCalendar feed.
//!
//! Output is regenerated from scratch each run; no state is read back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cyanea_core::{Component, Event, Filestore, PluginDecl, Sink};
use icalendar::{Calendar, Component as _, Property};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::ical::{self, VeventMeta};

fn default_path() -> String {
    "events.ics".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Where the feed is written, relative to the filestore root
    #[serde(default = "default_path")]
    pub path: String,
    /// Calendar name shown by subscribing clients
    pub name: Option<String>,
    /// Leave out events that already ended
    #[serde(default)]
    pub upcoming_only: bool,
}

pub fn declaration() -> PluginDecl {
    PluginDecl::new().with_sink(Component::typed(
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "minLength": 1 },
                "name": { "type": "string" },
                "upcoming_only": { "type": "boolean" }
            },
            "additionalProperties": false
        }),
        |config: FeedConfig| async move { Ok(Box::new(IcsFeed::new(config)) as Box<dyn Sink>) },
    ))
}

pub struct IcsFeed {
    config: FeedConfig,
}

impl IcsFeed {
    pub fn new(config: FeedConfig) -> Self {
        IcsFeed { config }
    }

    pub fn generate(&self, events: &[Event], now: DateTime<Utc>) -> anyhow::Result<String> {
        let mut cal = Calendar::new();
        if let Some(name) = &self.config.name {
            cal.append_property(Property::new("X-WR-CALNAME", name));
        }

        for event in events {
            if self.config.upcoming_only && event.end < now.timestamp_millis() {
                continue;
            }

            let description = describe(event);
            let uid = format!("{}@cyanea", event.id);
            let mut vevent = ical::vevent(
                event,
                &VeventMeta {
                    uid: &uid,
                    description: &description,
                    stamp: now,
                    tz: Tz::UTC,
                },
            )?;

            if let Some(kind) = &event.kind {
                let tags: Vec<String> = kind.tags().into_iter().map(ical::escape_text).collect();
                vevent.append_property(Property::new("CATEGORIES", tags.join(",")));
            }
            if let Some(banner) = &event.banner {
                vevent.append_property(Property::new("ATTACH", banner));
            }
            if let Some(url) = event.links.as_ref().and_then(|links| links.values().next()) {
                vevent.append_property(Property::new("URL", url));
            }

            cal.push(vevent);
        }

        Ok(ical::render(cal))
    }
}

/// The description plus every link, one per line.
fn describe(event: &Event) -> String {
    let links: Vec<String> = event
        .links
        .iter()
        .flatten()
        .map(|(name, url)| format!("{name}: {url}"))
        .collect();

    match (event.description.is_empty(), links.is_empty()) {
        (_, true) => event.description.clone(),
        (true, false) => links.join("\n"),
        (false, false) => format!("{}\n\n{}", event.description, links.join("\n")),
    }
}

#[async_trait]
impl Sink for IcsFeed {
    async fn sync_events(
        &self,
        events: &[Event],
        filestore: &dyn Filestore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let feed = self.generate(events, now)?;
        filestore
            .write_file(&self.config.path, feed.into_bytes())
            .await?;
        info!(path = %self.config.path, events = events.len(), "wrote ics feed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cyanea_core::EventType;
    use cyanea_core::filestore::StagingFilestore;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn event(id: &str, title: &str, start: i64) -> Event {
        Event {
            id: id.to_string(),
            title: title.to_string(),
            kind: None,
            description: "Weekly meeting".to_string(),
            location: "Boelter 4760".to_string(),
            banner: None,
            start,
            end: start + 3_600_000,
            links: None,
            meta: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn feed(upcoming_only: bool) -> IcsFeed {
        IcsFeed::new(FeedConfig {
            path: "feeds/acm.ics".into(),
            name: Some("ACM Events".into()),
            upcoming_only,
        })
    }

    #[tokio::test]
    async fn test_writes_feed_to_filestore() {
        let store = StagingFilestore::default();
        let events = vec![
            event("past", "Kickoff", 1_690_000_000_000),
            event("next", "Hack Night", 1_710_000_000_000),
        ];

        feed(false).sync_events(&events, &store, now()).await.unwrap();

        let files = store.staged.take();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "feeds/acm.ics");
        let ics = String::from_utf8(files[0].content.clone()).unwrap();
        assert!(ics.contains("X-WR-CALNAME:ACM Events"));
        assert!(ics.contains("UID:past@cyanea"));
        assert!(ics.contains("UID:next@cyanea"));
        assert!(ics.contains("DTSTAMP:20231114T221320Z"));
    }

    #[test]
    fn test_upcoming_only_skips_past_events() {
        let events = vec![
            event("past", "Kickoff", 1_690_000_000_000),
            event("next", "Hack Night", 1_710_000_000_000),
        ];

        let ics = feed(true).generate(&events, now()).unwrap();

        assert!(!ics.contains("UID:past@cyanea"));
        assert!(ics.contains("UID:next@cyanea"));
    }

    #[test]
    fn test_categories_banner_and_links() {
        let mut e = event("ws", "Workshop", 1_710_000_000_000);
        e.kind = Some(EventType::Many(vec!["workshop".into(), "ai".into()]));
        e.banner = Some("https://acm.example/banner.png".into());
        e.links = Some(BTreeMap::from([(
            "slides".to_string(),
            "https://acm.example/slides".to_string(),
        )]));

        let ics = feed(false).generate(&[e], now()).unwrap();

        assert!(ics.contains("CATEGORIES:workshop"));
        assert!(ics.contains("ATTACH:https://acm.example/banner.png"));
        assert!(ics.contains("URL:https://acm.example/slides"));
    }

    #[test]
    fn test_categories_are_escaped() {
        let mut e = event("ws", "Workshop", 1_710_000_000_000);
        e.kind = Some(EventType::Many(vec!["food, drinks".into(), "a;b".into()]));

        let ics = feed(false).generate(&[e], now()).unwrap();

        assert!(ics.contains(r"CATEGORIES:food\, drinks,a\;b"));
    }

    #[test]
    fn test_describe_appends_links() {
        let mut e = event("ws", "Workshop", 0);
        e.links = Some(BTreeMap::from([("rsvp".to_string(), "https://r.example".to_string())]));

        assert_eq!(describe(&e), "Weekly meeting\n\nrsvp: https://r.example");

        e.description.clear();
        assert_eq!(describe(&e), "rsvp: https://r.example");
    }

    #[tokio::test]
    async fn test_event_ending_before_start_fails_the_sink() {
        let store = StagingFilestore::default();
        let mut e = event("bad", "Backwards", 1_710_000_000_000);
        e.end = e.start - 1;

        let err = feed(false).sync_events(&[e], &store, now()).await.unwrap_err();

        assert!(err.to_string().contains("ends before it starts"));
        assert!(store.staged.is_empty());
    }

    #[tokio::test]
    async fn test_defaults_from_declaration() {
        let sink = crate::builtin_loader()
            .load_component::<dyn Sink>("ics", &json!({}))
            .await
            .unwrap();
        let store = StagingFilestore::default();

        sink.sync_events(&[], &store, now()).await.unwrap();

        assert_eq!(store.staged.take()[0].path, "events.ics");
    }
}
