//! Zone group topology
//!
//! Decoded from the `ZoneGroupState` document that ZoneGroupTopology
//! publishes both as an evented variable and as the result of
//! `GetZoneGroupState`.

use serde::Deserialize;
use sonos_discovery::DeviceUuid;

use crate::error::Result;

/// One player within a zone group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneMember {
    pub uuid: DeviceUuid,
    pub zone_name: String,
    /// Description URL advertised for the player
    pub location: String,
    /// Hidden players, e.g. the surrounds of a home theater
    pub invisible: bool,
    pub is_zone_bridge: bool,
    /// Bonded satellite of the member listed before it
    pub is_satellite: bool,
}

impl ZoneMember {
    pub fn is_visible(&self) -> bool {
        !self.invisible
    }
}

/// A group of players playing in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneGroup {
    pub id: String,
    pub coordinator: DeviceUuid,
    /// Members in document order; satellites follow the member they belong to
    pub members: Vec<ZoneMember>,
}

impl ZoneGroup {
    pub fn contains(&self, uuid: &DeviceUuid) -> bool {
        self.members.iter().any(|member| &member.uuid == uuid)
    }

    pub fn coordinator_member(&self) -> Option<&ZoneMember> {
        self.members.iter().find(|member| member.uuid == self.coordinator)
    }
}

/// Household grouping, derived from the latest `ZoneGroupState`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneTopology {
    groups: Vec<ZoneGroup>,
}

impl ZoneTopology {
    pub fn new(groups: Vec<ZoneGroup>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[ZoneGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, id: &str) -> Option<&ZoneGroup> {
        self.groups.iter().find(|group| group.id == id)
    }

    /// The group `uuid` currently belongs to
    pub fn group_of(&self, uuid: &DeviceUuid) -> Option<&ZoneGroup> {
        self.groups.iter().find(|group| group.contains(uuid))
    }

    pub fn coordinator_of(&self, uuid: &DeviceUuid) -> Option<&DeviceUuid> {
        self.group_of(uuid).map(|group| &group.coordinator)
    }

    pub fn is_coordinator(&self, uuid: &DeviceUuid) -> bool {
        self.groups.iter().any(|group| &group.coordinator == uuid)
    }

    pub fn members(&self) -> impl Iterator<Item = &ZoneMember> {
        self.groups.iter().flat_map(|group| group.members.iter())
    }

    pub fn visible_members(&self) -> impl Iterator<Item = &ZoneMember> {
        self.members().filter(|member| member.is_visible())
    }

    pub fn zone_bridges(&self) -> impl Iterator<Item = &ZoneMember> {
        self.members().filter(|member| member.is_zone_bridge)
    }
}

#[derive(Debug, Deserialize)]
struct ZoneGroupStateDoc {
    #[serde(rename = "ZoneGroups", default)]
    zone_groups: ZoneGroupsDoc,
}

#[derive(Debug, Default, Deserialize)]
struct ZoneGroupsDoc {
    #[serde(rename = "ZoneGroup", default)]
    groups: Vec<ZoneGroupDoc>,
}

#[derive(Debug, Deserialize)]
struct ZoneGroupDoc {
    #[serde(rename = "@Coordinator")]
    coordinator: String,
    #[serde(rename = "@ID")]
    id: String,
    #[serde(rename = "ZoneGroupMember", default)]
    members: Vec<MemberDoc>,
}

#[derive(Debug, Deserialize)]
struct MemberDoc {
    #[serde(rename = "@UUID")]
    uuid: String,
    #[serde(rename = "@Location", default)]
    location: String,
    #[serde(rename = "@ZoneName", default)]
    zone_name: String,
    #[serde(rename = "@Invisible", default)]
    invisible: Option<String>,
    #[serde(rename = "@IsZoneBridge", default)]
    is_zone_bridge: Option<String>,
    #[serde(rename = "Satellite", default)]
    satellites: Vec<MemberDoc>,
}

impl MemberDoc {
    fn into_member(self, is_satellite: bool) -> ZoneMember {
        ZoneMember {
            uuid: DeviceUuid::new(&self.uuid),
            zone_name: self.zone_name,
            location: self.location,
            invisible: self.invisible.as_deref() == Some("1"),
            is_zone_bridge: self.is_zone_bridge.as_deref() == Some("1"),
            is_satellite,
        }
    }
}

/// Parse a `ZoneGroupState` document.
///
/// Accepts both the `<ZoneGroupState><ZoneGroups>` form current firmware
/// sends and a bare `<ZoneGroups>` root.
pub fn parse_zone_group_state(xml: &str) -> Result<ZoneTopology> {
    let groups = if root_name(xml) == Some("ZoneGroups") {
        quick_xml::de::from_str::<ZoneGroupsDoc>(xml)?.groups
    } else {
        quick_xml::de::from_str::<ZoneGroupStateDoc>(xml)?
            .zone_groups
            .groups
    };

    let groups = groups
        .into_iter()
        .map(|group| {
            let mut members = Vec::new();
            for mut member in group.members {
                let satellites = std::mem::take(&mut member.satellites);
                members.push(member.into_member(false));
                members.extend(satellites.into_iter().map(|s| s.into_member(true)));
            }
            ZoneGroup {
                id: group.id,
                coordinator: DeviceUuid::new(&group.coordinator),
                members,
            }
        })
        .collect();

    Ok(ZoneTopology::new(groups))
}

/// Name of the first element, skipping the prolog.
fn root_name(xml: &str) -> Option<&str> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
}
