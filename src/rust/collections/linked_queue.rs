// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::slab::Slab;

// A doubly-linked FIFO queue whose nodes live in a slab. Every element gets a stable key on insertion, so an element
// can be unlinked from the middle of the queue in O(1) through its key, without any back-pointer into the element.
#[derive(Debug)]
pub struct LinkedQueue<T> {
    // Storage for the nodes.
    nodes: Slab<Node<T>>,
    // Key of the first element in the queue.
    front: Option<usize>,
    // Key of the last element in the queue.
    back: Option<usize>,
}

#[derive(Debug)]
struct Node<T> {
    prev: Option<usize>,
    next: Option<usize>,
    value: T,
}

impl<T> LinkedQueue<T> {
    // Create an empty LinkedQueue.
    #[inline]
    pub fn new() -> Self {
        LinkedQueue {
            nodes: Slab::new(),
            front: None,
            back: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.front.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    // Add the given element to the back of the queue and return its key.
    pub fn push_back(&mut self, value: T) -> usize {
        let key: usize = self.nodes.insert(Node {
            prev: self.back,
            next: None,
            value,
        });
        match self.back {
            // Point the current last element's next link at the new element.
            Some(back) => self.nodes[back].next = Some(key),
            // Nothing currently on the queue, so the new element also becomes the front.
            None => self.front = Some(key),
        }
        self.back = Some(key);
        key
    }

    // Pop the first element off the front of the queue.
    pub fn pop_front(&mut self) -> Option<T> {
        let front: usize = self.front?;
        self.remove(front)
    }

    // Unlink the element with the given key, wherever it sits in the queue.
    pub fn remove(&mut self, key: usize) -> Option<T> {
        if !self.nodes.contains(key) {
            return None;
        }
        let node: Node<T> = self.nodes.remove(key);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.front = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.back = node.prev,
        }
        Some(node.value)
    }

    pub fn front(&self) -> Option<&T> {
        self.front.map(|key| &self.nodes[key].value)
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.nodes.get(key).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.nodes.get_mut(key).map(|node| &mut node.value)
    }

    // Iterate over (key, element) pairs from front to back.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.front,
        }
    }
}

pub struct Iter<'a, T> {
    queue: &'a LinkedQueue<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let key: usize = self.cursor?;
        let node: &'a Node<T> = &self.queue.nodes[key];
        self.cursor = node.next;
        Some((key, &node.value))
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
