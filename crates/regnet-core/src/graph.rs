//! Topology graph derived from node and channel state.
//!
//! The graph is what the rendering layer draws: one box per node and one link
//! per non-closed channel plus one link from every Lightning node to its
//! Bitcoin backend.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::network::Network;
use crate::node_info::{Channel, ChannelStatus, LightningNodeState};

const NODE_WIDTH: f64 = 200.0;
const NODE_BASE_HEIGHT: f64 = 36.0;
const LINK_ROW_HEIGHT: f64 = 24.0;
const NODE_SPACING: f64 = 250.0;
const GRID_SIZE: f64 = 20.0;

/// A point on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal offset.
    pub x: f64,
    /// Vertical offset.
    pub y: f64,
}

/// Dimensions of a node box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    /// Box width.
    pub width: f64,
    /// Box height.
    pub height: f64,
}

/// What a chart node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartNodeKind {
    /// A Bitcoin backend.
    Bitcoin,
    /// A Lightning node.
    Lightning,
}

/// A node box keyed by node name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartNode {
    /// Node name.
    pub id: String,
    /// Node kind.
    pub kind: ChartNodeKind,
    /// Position on the canvas.
    pub position: Position,
    /// Box size, `None` until first laid out.
    pub size: Option<Size>,
}

/// Link category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkType {
    /// Lightning node to its Bitcoin backend.
    Backend,
    /// A confirmed channel.
    OpenChannel,
    /// A channel in any state other than open.
    PendingChannel,
}

/// Which way a channel link points on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkDirection {
    /// Left to right.
    Ltr,
    /// Right to left.
    Rtl,
}

/// One end of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEnd {
    /// Name of the node at this end.
    pub node_id: String,
}

/// Data attached to a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkProperties {
    /// Link category.
    #[serde(rename = "type")]
    pub kind: LinkType,
    /// Channel status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChannelStatus>,
    /// Channel capacity in satoshis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    /// Screen direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<LinkDirection>,
    /// Channel point as reported by the opening node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_point: Option<String>,
    /// Balance on the opening side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_balance: Option<String>,
    /// Balance on the remote side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_balance: Option<String>,
}

/// A link keyed by a channel's unique id, or `<node>-<backend>` for backend links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartLink {
    /// Link key.
    pub id: String,
    /// Opening side.
    pub from: LinkEnd,
    /// Remote side.
    pub to: LinkEnd,
    /// Link data.
    pub properties: LinkProperties,
}

impl ChartLink {
    fn is_channel(&self) -> bool {
        self.properties.kind != LinkType::Backend
    }

    fn touches(&self, node: &str) -> bool {
        self.from.node_id == node || self.to.node_id == node
    }
}

/// The renderable graph of one network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    /// Node boxes keyed by node name.
    pub nodes: BTreeMap<String, ChartNode>,
    /// Links keyed by link id.
    pub links: BTreeMap<String, ChartLink>,
}

/// Snap a position to a 20 unit grid when `snap_to_grid` is set.
pub fn snap(position: Position, snap_to_grid: bool) -> Position {
    if !snap_to_grid {
        return position;
    }
    Position {
        x: (position.x / GRID_SIZE).round() * GRID_SIZE,
        y: (position.y / GRID_SIZE).round() * GRID_SIZE,
    }
}

fn direction(from: &ChartNode, to: &ChartNode) -> LinkDirection {
    if from.position.x > to.position.x {
        LinkDirection::Rtl
    } else {
        LinkDirection::Ltr
    }
}

fn node_size(existing: Option<Size>, channel_links: usize) -> Size {
    #[allow(clippy::cast_precision_loss)]
    let rows = channel_links as f64;
    Size {
        width: existing.map_or(NODE_WIDTH, |s| s.width),
        height: LINK_ROW_HEIGHT.mul_add(rows, NODE_BASE_HEIGHT),
    }
}

/// Lay out a fresh chart for `network`: Lightning nodes on the top row,
/// Bitcoin nodes below, and a backend link for every Lightning node.
#[allow(clippy::cast_lossless)]
pub fn init_chart(network: &Network) -> Chart {
    let mut chart = Chart::default();

    for node in &network.nodes.lightning {
        chart.nodes.insert(
            node.name.clone(),
            ChartNode {
                id: node.name.clone(),
                kind: ChartNodeKind::Lightning,
                position: Position {
                    x: (node.id as f64).mul_add(NODE_SPACING, 50.0),
                    y: 50.0,
                },
                size: Some(node_size(None, 0)),
            },
        );
        let id = format!("{}-{}", node.name, node.backend_name);
        chart.links.insert(
            id.clone(),
            ChartLink {
                id,
                from: LinkEnd { node_id: node.name.clone() },
                to: LinkEnd { node_id: node.backend_name.clone() },
                properties: LinkProperties {
                    kind: LinkType::Backend,
                    status: None,
                    capacity: None,
                    direction: None,
                    channel_point: None,
                    from_balance: None,
                    to_balance: None,
                },
            },
        );
    }

    for node in &network.nodes.bitcoin {
        chart.nodes.insert(
            node.name.clone(),
            ChartNode {
                id: node.name.clone(),
                kind: ChartNodeKind::Bitcoin,
                position: Position {
                    x: (node.id as f64).mul_add(NODE_SPACING, 175.0),
                    y: 300.0,
                },
                size: Some(node_size(None, 0)),
            },
        );
    }

    chart
}

fn channel_link(channel: &Channel, from: &ChartNode, to: &ChartNode) -> ChartLink {
    let kind = if channel.pending {
        LinkType::PendingChannel
    } else {
        LinkType::OpenChannel
    };
    ChartLink {
        id: channel.unique_id.clone(),
        from: LinkEnd { node_id: from.id.clone() },
        to: LinkEnd { node_id: to.id.clone() },
        properties: LinkProperties {
            kind,
            status: Some(channel.status),
            capacity: Some(channel.capacity.clone()),
            direction: Some(direction(from, to)),
            channel_point: Some(channel.channel_point.clone()),
            from_balance: Some(channel.local_balance.clone()),
            to_balance: Some(channel.remote_balance.clone()),
        },
    }
}

/// Reconcile `chart` with the latest per-node channel state.
///
/// Every channel of every node with known channels becomes a link keyed by
/// its unique id; channel links of those nodes that no longer exist are
/// removed. Links opened by a node whose channels are still unknown are left
/// untouched. Node heights are recomputed from their channel link count.
/// Running it twice on the same state yields the same chart.
pub fn update_chart_from_nodes(
    chart: &Chart,
    nodes: &BTreeMap<String, LightningNodeState>,
) -> Chart {
    let pubkeys: HashMap<&str, &str> = nodes
        .iter()
        .filter_map(|(name, state)| {
            state
                .info
                .as_ref()
                .map(|info| (info.pubkey.as_str(), name.as_str()))
        })
        .collect();

    let mut links: BTreeMap<String, ChartLink> = chart
        .links
        .iter()
        .filter(|(_, link)| {
            !link.is_channel()
                || nodes
                    .get(&link.from.node_id)
                    .is_none_or(|state| state.channels.is_none())
        })
        .map(|(id, link)| (id.clone(), link.clone()))
        .collect();

    for (name, state) in nodes {
        let (Some(channels), Some(from)) = (&state.channels, chart.nodes.get(name)) else {
            continue;
        };
        for channel in channels {
            let to = pubkeys
                .get(channel.pubkey.as_str())
                .and_then(|to_name| chart.nodes.get(*to_name));
            if let Some(to) = to {
                links.insert(channel.unique_id.clone(), channel_link(channel, from, to));
            }
        }
    }

    let mut chart = Chart {
        nodes: chart.nodes.clone(),
        links,
    };
    chart.resize_nodes();
    chart
}

impl Chart {
    fn resize_nodes(&mut self) {
        for (name, node) in &mut self.nodes {
            let count = self
                .links
                .values()
                .filter(|link| link.is_channel() && link.touches(name))
                .count();
            node.size = Some(node_size(node.size, count));
        }
    }

    /// Bring the node boxes and backend links in line with `network`.
    ///
    /// Nodes added since the chart was laid out get their default position,
    /// and nodes no longer in the network are dropped together with every
    /// link touching them. Existing positions are kept.
    pub fn sync_network(&mut self, network: &Network) {
        let fresh = init_chart(network);

        self.nodes.retain(|name, _| fresh.nodes.contains_key(name));
        self.links.retain(|id, link| {
            let ends_exist = fresh.nodes.contains_key(&link.from.node_id)
                && fresh.nodes.contains_key(&link.to.node_id);
            ends_exist && (link.is_channel() || fresh.links.contains_key(id))
        });

        for (name, node) in fresh.nodes {
            self.nodes.entry(name).or_insert(node);
        }
        for (id, link) in fresh.links {
            self.links.entry(id).or_insert(link);
        }
        self.resize_nodes();
    }

    /// Move a node, re-pointing its channel links. Returns `false` if the node is unknown.
    pub fn move_node(&mut self, name: &str, position: Position, snap_to_grid: bool) -> bool {
        let Some(node) = self.nodes.get_mut(name) else {
            return false;
        };
        node.position = snap(position, snap_to_grid);

        for link in self.links.values_mut() {
            if !link.is_channel() || !link.touches(name) {
                continue;
            }
            if let (Some(from), Some(to)) = (
                self.nodes.get(&link.from.node_id),
                self.nodes.get(&link.to.node_id),
            ) {
                link.properties.direction = Some(direction(from, to));
            }
        }
        true
    }
}
