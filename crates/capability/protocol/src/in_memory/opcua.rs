//! 内存 OPC UA 服务端
//!
//! 地址空间是一棵以 [`OPCUA_ROOT_NODE`] 为根的树。通过 [`InMemoryOpcUa::set_node`]
//! 首次出现的变量节点挂在根节点下；需要层级时用 [`InMemoryOpcUa::insert_node`]。

use super::probe::LinkProbe;
use crate::error::TransportError;
use crate::transport::{NodeInfo, OPCUA_ROOT_NODE, OpcUaRequest, OpcUaResponse, Transport};
use async_trait::async_trait;
use domain::TagValue;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Node {
    info: NodeInfo,
    children: Vec<String>,
}

#[derive(Debug)]
struct AddressSpace {
    tree: HashMap<String, Node>,
    values: HashMap<String, TagValue>,
    monitors: HashMap<String, Vec<mpsc::UnboundedSender<TagValue>>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        let root = Node {
            info: NodeInfo {
                node_id: OPCUA_ROOT_NODE.to_string(),
                browse_name: "Root".to_string(),
                display_name: "Root".to_string(),
                namespace: 0,
            },
            children: Vec::new(),
        };
        Self {
            tree: HashMap::from([(OPCUA_ROOT_NODE.to_string(), root)]),
            values: HashMap::new(),
            monitors: HashMap::new(),
        }
    }
}

impl AddressSpace {
    fn attach(&mut self, parent: &str, info: NodeInfo) {
        let node_id = info.node_id.clone();
        if self.tree.contains_key(&node_id) {
            return;
        }
        let parent = if self.tree.contains_key(parent) {
            parent
        } else {
            OPCUA_ROOT_NODE
        };
        if let Some(parent) = self.tree.get_mut(parent) {
            parent.children.push(node_id.clone());
        }
        self.tree.insert(
            node_id,
            Node {
                info,
                children: Vec::new(),
            },
        );
    }

    fn store(&mut self, node_id: &str, value: TagValue) {
        self.attach(OPCUA_ROOT_NODE, NodeInfo::from_node_id(node_id));
        if let Some(senders) = self.monitors.get_mut(node_id) {
            senders.retain(|sender| sender.send(value.clone()).is_ok());
        }
        self.values.insert(node_id.to_string(), value);
    }

    fn value(&self, node_id: &str) -> Result<TagValue, TransportError> {
        match self.values.get(node_id) {
            Some(value) => Ok(value.clone()),
            None if self.tree.contains_key(node_id) => Err(TransportError::Fault(format!(
                "BadAttributeIdInvalid: {} has no value",
                node_id
            ))),
            None => Err(unknown_node(node_id)),
        }
    }

    fn node(&self, node_id: &str) -> Result<&Node, TransportError> {
        self.tree.get(node_id).ok_or_else(|| unknown_node(node_id))
    }

    fn children(&self, node_id: &str) -> Result<Vec<NodeInfo>, TransportError> {
        let node = self.node(node_id)?;
        Ok(node
            .children
            .iter()
            .filter_map(|child| self.tree.get(child))
            .map(|child| child.info.clone())
            .collect())
    }
}

/// 内存 OPC UA 服务端，节点值以服务端原生类型保存
#[derive(Debug, Default)]
pub struct InMemoryOpcUa {
    probe: LinkProbe,
    space: Mutex<AddressSpace>,
}

impl InMemoryOpcUa {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> &LinkProbe {
        &self.probe
    }

    fn with<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> R {
        let mut space = self.space.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut space)
    }

    /// 设置节点值并通知监控项
    pub fn set_node(&self, node_id: impl Into<String>, value: TagValue) {
        let node_id = node_id.into();
        self.with(|space| space.store(&node_id, value));
    }

    /// 在 `parent` 下加入节点；`value` 为空时是只能浏览的文件夹节点。
    /// 父节点不存在时挂到根节点下。
    pub fn insert_node(
        &self,
        parent: &str,
        node_id: impl Into<String>,
        display_name: &str,
        value: Option<TagValue>,
    ) {
        let mut info = NodeInfo::from_node_id(node_id);
        info.display_name = display_name.to_string();
        let node_id = info.node_id.clone();
        self.with(|space| {
            space.attach(parent, info);
            if let Some(value) = value {
                space.store(&node_id, value);
            }
        });
    }

    pub fn node(&self, node_id: &str) -> Option<TagValue> {
        self.with(|space| space.values.get(node_id).cloned())
    }

    fn apply(&self, request: OpcUaRequest) -> Result<OpcUaResponse, TransportError> {
        self.with(|space| match request {
            OpcUaRequest::Read { node_id } => space.value(&node_id).map(OpcUaResponse::Value),
            OpcUaRequest::Write { node_id, value } => {
                space.value(&node_id)?;
                space.store(&node_id, value);
                Ok(OpcUaResponse::Written)
            }
            OpcUaRequest::Monitor { node_id, .. } => {
                let current = space.value(&node_id)?;
                let (sender, receiver) = mpsc::unbounded_channel();
                // 监控项建立后先推送一次当前值
                let _ = sender.send(current);
                space.monitors.entry(node_id).or_default().push(sender);
                Ok(OpcUaResponse::Monitored(receiver))
            }
            OpcUaRequest::Browse { node_id } => {
                let node_id = node_id.as_deref().unwrap_or(OPCUA_ROOT_NODE);
                space.children(node_id).map(OpcUaResponse::Children)
            }
            OpcUaRequest::NodeInfo { node_id } => space
                .node(&node_id)
                .map(|node| OpcUaResponse::Node(node.info.clone())),
        })
    }
}

fn unknown_node(node_id: &str) -> TransportError {
    TransportError::Fault(format!("BadNodeIdUnknown: {}", node_id))
}

#[async_trait]
impl Transport for InMemoryOpcUa {
    type Request = OpcUaRequest;
    type Response = OpcUaResponse;

    async fn open(&self) -> Result<(), TransportError> {
        self.probe.open().await
    }

    async fn close(&self) {
        self.probe.close();
        // 会话关闭后监控项失效
        self.with(|space| space.monitors.clear());
    }

    async fn call(&self, request: OpcUaRequest) -> Result<OpcUaResponse, TransportError> {
        self.probe.call(|| self.apply(request)).await
    }
}
