// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Arena call tree and the post-processing applied to captured graphs.
//!
//! A captured graph arrives as a flat level-order list. It is rebuilt as a tree, its
//! frames are attributed to business transactions through the thread-proxy frames that
//! scheduled them, identical sibling paths are merged, and the result is flattened again.

use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::proxy::thread_proxy::{is_thread_proxy_name, CallContextEntry, ANONYMOUS_PROXY_NAME};
use crate::snapshot::model::{
    AllocationBtData, AllocationElement, CallBtData, CallElement, ProcessAllocationGraph,
    ProcessCallGraph,
};

/// Sampling interval of the CPU profiler.
pub const SAMPLE_INTERVAL_MS: u64 = 1;

const IDLE_METHOD: &str = "(program)";
const ROOT_CLASS: &str = "(global)";
const ROOT_METHOD: &str = "(root)";

/// Files that belong to the agent itself.
const AGENT_FILE_PATTERN: &str = r"[/\\]apm[-_]agent[^/\\]*[/\\]";

fn agent_file_filter() -> &'static Regex {
    static FILTER: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    FILTER.get_or_init(|| Regex::new(AGENT_FILE_PATTERN).expect("failed creating regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphMode {
    /// Sampled CPU graph: weights are times, every merged frame counts once.
    Cpu,
    /// Allocation graph: weights are sizes, counts are allocation counts.
    Heap,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostProcessOptions {
    /// Splice out frames whose file belongs to the agent, re-parenting their children.
    pub exclude_agent_frames: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BtKey {
    bt_id: i64,
    snapshot_guid: Option<String>,
}

#[derive(Debug, Clone)]
struct BtData {
    key: BtKey,
    total: u64,
    count: u64,
    /// Created on an ancestor by back-propagation rather than observed on the frame.
    synthetic: bool,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    klass: String,
    method: String,
    file_name: String,
    line_number: i64,
    samples: Option<u64>,
    /// Time taken (CPU) or allocated size (heap).
    weight: Option<u64>,
    count: u64,
    stamp: Option<BtKey>,
    bt_data: Vec<BtData>,
    children: Vec<usize>,
}

impl From<CallElement> for Frame {
    fn from(element: CallElement) -> Self {
        Self {
            klass: element.klass,
            method: element.method,
            file_name: element.file_name,
            line_number: element.line_number,
            samples: element.samples_count,
            weight: element.time_taken,
            bt_data: element
                .proc_call_elem_bt_data
                .into_iter()
                .map(|data| BtData {
                    key: BtKey {
                        bt_id: data.bt_id,
                        snapshot_guid: data.bt_snap_guid,
                    },
                    total: data.total_time_taken,
                    count: data.count,
                    synthetic: false,
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl From<AllocationElement> for Frame {
    fn from(element: AllocationElement) -> Self {
        Self {
            klass: element.klass,
            method: element.method,
            file_name: element.file_name,
            line_number: element.line_number,
            weight: Some(element.size),
            count: element.count,
            bt_data: element
                .proc_allocation_elem_bt_data
                .into_iter()
                .map(|data| BtData {
                    key: BtKey {
                        bt_id: data.bt_id,
                        snapshot_guid: data.bt_snap_guid,
                    },
                    total: data.total_size,
                    count: data.count,
                    synthetic: false,
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Frame {
    fn into_call_element(self, num_children: usize) -> CallElement {
        CallElement {
            klass: self.klass,
            method: self.method,
            file_name: self.file_name,
            line_number: self.line_number,
            num_children,
            samples_count: self.samples,
            time_taken: self.weight,
            proc_call_elem_bt_data: self
                .bt_data
                .into_iter()
                .map(|data| CallBtData {
                    bt_id: data.key.bt_id,
                    bt_snap_guid: data.key.snapshot_guid,
                    total_time_taken: data.total,
                    count: data.count,
                })
                .collect(),
        }
    }

    fn into_allocation_element(self, num_children: usize) -> AllocationElement {
        AllocationElement {
            klass: self.klass,
            method: self.method,
            file_name: self.file_name,
            line_number: self.line_number,
            num_children,
            size: self.weight.unwrap_or_default(),
            count: self.count,
            proc_allocation_elem_bt_data: self
                .bt_data
                .into_iter()
                .map(|data| AllocationBtData {
                    bt_id: data.key.bt_id,
                    bt_snap_guid: data.key.snapshot_guid,
                    total_size: data.total,
                    count: data.count,
                })
                .collect(),
        }
    }

    fn signature(&self) -> (&str, &str, i64, &str) {
        (&self.klass, &self.method, self.line_number, &self.file_name)
    }
}

/// Call tree stored as an arena. Detached frames stay in the arena but are unreachable
/// from the root.
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<Frame>,
    root: usize,
    mode: GraphMode,
}

impl CallTree {
    pub fn from_call_elements(elements: Vec<CallElement>) -> Option<Self> {
        Self::from_flat(
            elements
                .into_iter()
                .map(|element| {
                    let num_children = element.num_children;
                    (Frame::from(element), num_children)
                })
                .collect(),
            GraphMode::Cpu,
        )
    }

    pub fn from_allocation_elements(elements: Vec<AllocationElement>) -> Option<Self> {
        Self::from_flat(
            elements
                .into_iter()
                .map(|element| {
                    let num_children = element.num_children;
                    (Frame::from(element), num_children)
                })
                .collect(),
            GraphMode::Heap,
        )
    }

    /// Rebuilds the tree from a level-order list. A list that ends before every declared
    /// child was seen yields the frames that were present.
    fn from_flat(items: Vec<(Frame, usize)>, mode: GraphMode) -> Option<Self> {
        let mut items = items.into_iter();
        let (root, root_children) = items.next()?;
        let mut nodes = vec![root];
        let mut declared = vec![root_children];
        let mut queue = VecDeque::from([0]);

        while let Some(idx) = queue.pop_front() {
            for _ in 0..declared[idx] {
                let Some((frame, num_children)) = items.next() else {
                    debug!("call graph ended before all declared children were read");
                    break;
                };
                let child = nodes.len();
                nodes.push(frame);
                declared.push(num_children);
                nodes[idx].children.push(child);
                queue.push_back(child);
            }
        }

        let leftover = items.count();
        if leftover > 0 {
            debug!("ignoring {leftover} call graph elements not reachable from the root");
        }

        Some(Self {
            nodes,
            root: 0,
            mode,
        })
    }

    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    /// Number of frames reachable from the root.
    pub fn len(&self) -> usize {
        self.pre_order().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_call_elements(self) -> Vec<CallElement> {
        self.flatten()
            .into_iter()
            .map(|(frame, num_children)| frame.into_call_element(num_children))
            .collect()
    }

    pub fn into_allocation_elements(self) -> Vec<AllocationElement> {
        self.flatten()
            .into_iter()
            .map(|(frame, num_children)| frame.into_allocation_element(num_children))
            .collect()
    }

    fn flatten(mut self) -> Vec<(Frame, usize)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            queue.extend(self.nodes[idx].children.iter().copied());
        }
        order
            .into_iter()
            .map(|idx| {
                let num_children = self.nodes[idx].children.len();
                (std::mem::take(&mut self.nodes[idx]), num_children)
            })
            .collect()
    }

    fn pre_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(self.nodes[idx].children.iter().rev().copied());
        }
        order
    }

    fn parents(&self, pre_order: &[usize]) -> Vec<Option<usize>> {
        let mut parents = vec![None; self.nodes.len()];
        for &idx in pre_order {
            for &child in &self.nodes[idx].children {
                parents[child] = Some(idx);
            }
        }
        parents
    }

    /// Accumulates sample counts into every ancestor and converts them to milliseconds.
    pub fn calculate_cpu_time(&mut self) {
        let pre_order = self.pre_order();
        let parents = self.parents(&pre_order);
        for &idx in pre_order.iter().rev() {
            if let Some(parent) = parents[idx] {
                let samples = self.nodes[idx].samples.unwrap_or_default();
                let parent = &mut self.nodes[parent];
                parent.samples = Some(parent.samples.unwrap_or_default() + samples);
            }
        }
        for idx in pre_order {
            let node = &mut self.nodes[idx];
            node.weight = Some(node.samples.take().unwrap_or_default() * SAMPLE_INTERVAL_MS);
        }
    }

    /// Stamps frames scheduled through a thread proxy with that proxy's business
    /// transaction. Descendants inherit the nearest stamp. Proxy frames are renamed so
    /// that identical paths from different contexts can merge.
    pub fn populate_call_context(&mut self, call_context: &HashMap<String, CallContextEntry>) {
        for idx in self.pre_order() {
            let node = &mut self.nodes[idx];
            if let Some(entry) = call_context.get(&node.method) {
                node.stamp = Some(BtKey {
                    bt_id: entry.bt_id,
                    snapshot_guid: entry.snapshot_guid.clone(),
                });
            }
            if is_thread_proxy_name(&node.method) {
                node.method = ANONYMOUS_PROXY_NAME.to_string();
                node.line_number = 0;
            }

            let Some(stamp) = node.stamp.clone() else {
                continue;
            };
            for child in self.nodes[idx].children.clone() {
                self.nodes[child].stamp = Some(stamp.clone());
            }
        }
    }

    /// Merges sibling frames with the same class, method, line and file. The last
    /// occurrence survives and takes over the weights, attributions and children of the
    /// others.
    pub fn merge_thread_paths(&mut self) {
        let mut queue = VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            let children = std::mem::take(&mut self.nodes[idx].children);
            let mut survivors: HashMap<(String, String, i64, String), usize> = HashMap::new();
            let mut kept = Vec::with_capacity(children.len());

            for &child in children.iter().rev() {
                let (klass, method, line_number, file_name) = self.nodes[child].signature();
                let signature = (
                    klass.to_string(),
                    method.to_string(),
                    line_number,
                    file_name.to_string(),
                );
                match survivors.get(&signature) {
                    Some(&first) => self.merge_into(first, child),
                    None => {
                        survivors.insert(signature, child);
                        self.absorb_bt_data(child, child);
                        kept.push(child);
                    }
                }
            }

            for &child in &kept {
                queue.push_front(child);
            }
            kept.reverse();
            self.nodes[idx].children = kept;
        }
    }

    fn merge_into(&mut self, first: usize, duplicate: usize) {
        let weight = self.nodes[duplicate].weight;
        let count = self.nodes[duplicate].count;
        let mode = self.mode;
        let survivor = &mut self.nodes[first];
        survivor.weight = match (survivor.weight, weight) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or_default() + b.unwrap_or_default()),
        };
        if mode == GraphMode::Heap {
            survivor.count += count;
        }

        self.absorb_bt_data(first, duplicate);

        let children = std::mem::take(&mut self.nodes[duplicate].children);
        self.nodes[first].children.extend(children);
    }

    /// Moves the stamp of `source` into the attribution list of `target`.
    fn absorb_bt_data(&mut self, target: usize, source: usize) {
        let Some(key) = self.nodes[source].stamp.take() else {
            return;
        };
        let total = self.nodes[source].weight.unwrap_or_default();
        let count = match self.mode {
            GraphMode::Cpu => 1,
            GraphMode::Heap => self.nodes[source].count,
        };
        let bt_data = &mut self.nodes[target].bt_data;
        match bt_data.iter_mut().find(|data| data.key == key) {
            Some(data) => {
                data.total += total;
                data.count += count;
            }
            None => bt_data.push(BtData {
                key,
                total,
                count,
                synthetic: false,
            }),
        }
    }

    /// Detaches the first idle frame directly under the root.
    pub fn remove_idle_node(&mut self) -> bool {
        let root = &self.nodes[self.root];
        let Some(position) = root
            .children
            .iter()
            .position(|&child| self.nodes[child].method == IDLE_METHOD)
        else {
            return false;
        };
        self.nodes[self.root].children.remove(position);
        true
    }

    /// Splices out agent frames; their children take their place in the parent.
    pub fn remove_agent_nodes(&mut self) -> usize {
        let filter = agent_file_filter();
        let mut removed = 0;
        let mut queue = VecDeque::from([self.root]);
        while let Some(idx) = queue.pop_front() {
            let mut pending: VecDeque<usize> =
                std::mem::take(&mut self.nodes[idx].children).into();
            let mut kept = Vec::with_capacity(pending.len());
            while let Some(child) = pending.pop_front() {
                if filter.is_match(&self.nodes[child].file_name) {
                    removed += 1;
                    for &grandchild in self.nodes[child].children.iter().rev() {
                        pending.push_front(grandchild);
                    }
                } else {
                    kept.push(child);
                }
            }
            queue.extend(kept.iter().copied());
            self.nodes[idx].children = kept;
        }
        removed
    }

    /// Copies every attribution up to the ancestors that lack it. Ancestors that carry
    /// their own attribution for a transaction keep it unchanged; synthetic copies sum
    /// everything propagated into them.
    pub fn backpropagate_call_context(&mut self) {
        let pre_order = self.pre_order();
        let parents = self.parents(&pre_order);
        for &idx in pre_order.iter().rev() {
            let Some(parent) = parents[idx] else {
                continue;
            };
            let propagated = self.nodes[idx].bt_data.clone();
            let parent_data = &mut self.nodes[parent].bt_data;
            for data in propagated {
                match parent_data.iter_mut().find(|existing| existing.key == data.key) {
                    None => parent_data.push(BtData {
                        synthetic: true,
                        ..data
                    }),
                    Some(existing) if existing.synthetic => {
                        existing.total += data.total;
                        existing.count += data.count;
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

/// Runs the CPU pipeline over `graph` in place. A `(global)/(root)` super-root is removed
/// and its child count recorded as the number of root elements.
pub fn post_process_call_graph(
    graph: &mut ProcessCallGraph,
    call_context: &HashMap<String, CallContextEntry>,
    options: PostProcessOptions,
) {
    let Some(mut tree) = CallTree::from_call_elements(std::mem::take(&mut graph.call_elements))
    else {
        return;
    };

    tree.calculate_cpu_time();
    tree.populate_call_context(call_context);
    tree.merge_thread_paths();
    tree.remove_idle_node();
    if options.exclude_agent_frames {
        tree.remove_agent_nodes();
    }
    tree.backpropagate_call_context();

    let mut elements = tree.into_call_elements();
    if let Some(root) = elements.first() {
        if root.klass == ROOT_CLASS && root.method == ROOT_METHOD {
            graph.num_of_root_elements = Some(root.num_children);
            elements.remove(0);
        }
    }
    graph.call_elements = elements;
}

pub fn post_process_allocation_graph(
    graph: &mut ProcessAllocationGraph,
    call_context: &HashMap<String, CallContextEntry>,
    options: PostProcessOptions,
) {
    let Some(mut tree) =
        CallTree::from_allocation_elements(std::mem::take(&mut graph.allocation_elements))
    else {
        return;
    };

    tree.populate_call_context(call_context);
    tree.merge_thread_paths();
    if options.exclude_agent_frames {
        tree.remove_agent_nodes();
    }
    tree.backpropagate_call_context();

    graph.allocation_elements = tree.into_allocation_elements();
    graph.num_of_root_elements = Some(1);
}
