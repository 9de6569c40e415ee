use crate::messages::handle::SendableHandle;

pub type NodeIndex = u32;

const NO_NODE: NodeIndex = NodeIndex::MAX;

/// Head of one slot's dependency chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DependencyList {
    head: NodeIndex,
    len: u32,
}

impl Default for DependencyList {
    fn default() -> Self {
        Self {
            head: NO_NODE,
            len: 0,
        }
    }
}

impl DependencyList {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Copy)]
struct DependencyNode {
    target: SendableHandle,
    next: NodeIndex,
}

/// Shared node storage for every slot's singly linked dependency chain,
/// recycled through a free list
#[derive(Default)]
pub struct DependencyNodes {
    nodes: Vec<DependencyNode>,
    free: Vec<NodeIndex>,
}

impl DependencyNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `target` to `list`. Returns false if no node could be allocated.
    pub fn push(&mut self, list: &mut DependencyList, target: SendableHandle) -> bool {
        let node = DependencyNode {
            target,
            next: list.head,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index as usize] = node;
                index
            }
            None => {
                if self.nodes.len() >= NO_NODE as usize || self.nodes.try_reserve(1).is_err() {
                    return false;
                }
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeIndex
            }
        };
        list.head = index;
        list.len += 1;
        true
    }

    /// Returns every node of `list` to the free list and clears it
    pub fn free_list(&mut self, list: &mut DependencyList) {
        let mut current = list.head;
        while current != NO_NODE {
            let next = self.nodes[current as usize].next;
            self.nodes[current as usize].target = SendableHandle::default();
            self.free.push(current);
            current = next;
        }
        *list = DependencyList::default();
    }

    /// Targets of `list`, most recently added first
    pub fn iter(&self, list: &DependencyList) -> DependencyIter<'_> {
        DependencyIter {
            nodes: self,
            current: list.head,
        }
    }

    /// Nodes currently in use across all lists
    pub fn in_use(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

pub struct DependencyIter<'a> {
    nodes: &'a DependencyNodes,
    current: NodeIndex,
}

impl<'a> Iterator for DependencyIter<'a> {
    type Item = SendableHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes.nodes.get(self.current as usize)?;
        self.current = node.next;
        Some(node.target)
    }
}

#[cfg(test)]
mod dependency_tests {
    use super::*;

    #[test]
    fn push_iterate_free() {
        let mut nodes = DependencyNodes::new();
        let mut list = DependencyList::default();
        assert!(nodes.push(&mut list, SendableHandle::new(7, 1)));
        assert!(nodes.push(&mut list, SendableHandle::new(9, 2)));
        assert_eq!(list.len(), 2);
        let targets: Vec<_> = nodes.iter(&list).collect();
        assert_eq!(
            targets,
            vec![SendableHandle::new(9, 2), SendableHandle::new(7, 1)]
        );

        nodes.free_list(&mut list);
        assert!(list.is_empty());
        assert_eq!(nodes.iter(&list).count(), 0);
        assert_eq!(nodes.in_use(), 0);
    }

    #[test]
    fn nodes_are_recycled() {
        let mut nodes = DependencyNodes::new();
        let mut a = DependencyList::default();
        let mut b = DependencyList::default();
        nodes.push(&mut a, SendableHandle::new(1, 1));
        nodes.push(&mut a, SendableHandle::new(2, 1));
        nodes.free_list(&mut a);
        nodes.push(&mut b, SendableHandle::new(3, 1));
        assert_eq!(nodes.in_use(), 1);
        assert_eq!(nodes.nodes.len(), 2);
        assert_eq!(nodes.iter(&b).collect::<Vec<_>>(), vec![SendableHandle::new(3, 1)]);
    }
}
