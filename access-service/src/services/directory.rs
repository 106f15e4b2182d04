//! Sites, their doors and staff, and how to reach each user.
//!
//! The directory is owned by another system; this service only reads it.
//! [`StaticDirectory`] serves it from a TOML file loaded through `config`.

use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

use crate::models::{Channel, PushPlatform, Recipient, SiteRole};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Site {
    pub site_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub doors: BTreeSet<String>,
    #[serde(default)]
    pub managers: Vec<String>,
    #[serde(default)]
    pub responders: Vec<String>,
    /// Everyone else attached to the site.
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub token: String,
    #[serde(default = "default_platform")]
    pub platform: PushPlatform,
}

fn default_platform() -> PushPlatform {
    PushPlatform::Fcm
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Contact {
    /// Addresses this user can be reached at on `channel`.
    pub fn recipients(&self, channel: Channel) -> Vec<Recipient> {
        match channel {
            Channel::Email => self
                .email
                .iter()
                .filter(|e| !e.trim().is_empty())
                .map(|e| Recipient::Email(e.clone()))
                .collect(),
            Channel::Sms => self
                .phone
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| Recipient::Phone(p.clone()))
                .collect(),
            Channel::Push => self
                .devices
                .iter()
                .map(|d| Recipient::Device {
                    token: d.token.clone(),
                    platform: d.platform,
                })
                .collect(),
        }
    }
}

pub trait Directory: Send + Sync {
    fn site(&self, site_id: &str) -> Option<Site>;

    fn has_door(&self, site_id: &str, door_id: &str) -> bool {
        self.site(site_id)
            .map(|s| s.doors.contains(door_id))
            .unwrap_or(false)
    }

    /// Every user attached to the site, staff included, without duplicates.
    fn members(&self, site_id: &str) -> Vec<String> {
        let Some(site) = self.site(site_id) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        site.managers
            .iter()
            .chain(site.responders.iter())
            .chain(site.members.iter())
            .filter(|u| seen.insert(u.as_str()))
            .cloned()
            .collect()
    }

    fn role_members(&self, site_id: &str, role: SiteRole) -> Vec<String> {
        match self.site(site_id) {
            Some(site) => match role {
                SiteRole::Manager => site.managers,
                SiteRole::Responder => site.responders,
            },
            None => Vec::new(),
        }
    }

    fn contact(&self, user_id: &str) -> Option<Contact>;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    sites: Vec<Site>,
    #[serde(default)]
    users: Vec<Contact>,
}

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    sites: HashMap<String, Site>,
    contacts: HashMap<String, Contact>,
}

impl StaticDirectory {
    pub fn new(sites: Vec<Site>, contacts: Vec<Contact>) -> Self {
        Self {
            sites: sites.into_iter().map(|s| (s.site_id.clone(), s)).collect(),
            contacts: contacts
                .into_iter()
                .map(|c| (c.user_id.clone(), c))
                .collect(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let file: DirectoryFile = Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        tracing::info!(
            path = %path,
            sites = file.sites.len(),
            users = file.users.len(),
            "Loaded site directory"
        );
        Ok(Self::new(file.sites, file.users))
    }

    pub fn from_toml(source: &str) -> Result<Self, config::ConfigError> {
        let file: DirectoryFile = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(Self::new(file.sites, file.users))
    }
}

impl Directory for StaticDirectory {
    fn site(&self, site_id: &str) -> Option<Site> {
        self.sites.get(site_id).cloned()
    }

    fn contact(&self, user_id: &str) -> Option<Contact> {
        self.contacts.get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[sites]]
        site_id = "S1"
        name = "North Plant"
        doors = ["D1", "D2"]
        managers = ["M1"]
        responders = ["R1", "M1"]
        members = ["U1"]

        [[users]]
        user_id = "U1"
        email = "u1@example.com"
        phone = "+15550001"

        [[users.devices]]
        token = "tok-u1"
        platform = "apns"

        [[users]]
        user_id = "M1"
        email = "m1@example.com"
    "#;

    #[test]
    fn parses_sites_and_contacts() {
        let directory = StaticDirectory::from_toml(SAMPLE).unwrap();

        assert!(directory.has_door("S1", "D1"));
        assert!(!directory.has_door("S1", "D9"));
        assert!(!directory.has_door("S2", "D1"));
        assert_eq!(directory.role_members("S1", SiteRole::Manager), vec!["M1"]);

        let contact = directory.contact("U1").unwrap();
        assert_eq!(
            contact.recipients(Channel::Push),
            vec![Recipient::Device {
                token: "tok-u1".to_string(),
                platform: PushPlatform::Apns
            }]
        );
        assert_eq!(
            contact.recipients(Channel::Sms),
            vec![Recipient::Phone("+15550001".to_string())]
        );
    }

    #[test]
    fn members_are_deduplicated() {
        let directory = StaticDirectory::from_toml(SAMPLE).unwrap();
        assert_eq!(directory.members("S1"), vec!["M1", "R1", "U1"]);
        assert!(directory.members("unknown").is_empty());
    }

    #[test]
    fn missing_channels_yield_no_recipients() {
        let directory = StaticDirectory::from_toml(SAMPLE).unwrap();
        let manager = directory.contact("M1").unwrap();
        assert!(manager.recipients(Channel::Sms).is_empty());
        assert!(manager.recipients(Channel::Push).is_empty());
    }
}
