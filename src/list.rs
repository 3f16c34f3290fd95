//! A generic doubly linked list implementation. Used as the reply queue and
//! as the general-purpose intrusive list the data model reserves for the
//! user-visible LIST type.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

#[derive(Debug)]
pub struct ListNode<T> {
    prev: Option<Weak<RefCell<ListNode<T>>>>,
    next: Option<Rc<RefCell<ListNode<T>>>>,
    value: Option<Rc<T>>,
}

impl<T> ListNode<T> {
    pub fn prev(&self) -> Option<Rc<RefCell<ListNode<T>>>> {
        self.prev.as_ref().and_then(|p| p.upgrade())
    }

    pub fn next(&self) -> Option<Rc<RefCell<ListNode<T>>>> {
        self.next.clone()
    }

    pub fn value(&self) -> Option<Rc<T>> {
        self.value.clone()
    }
}

#[derive(Debug)]
pub struct List<T> {
    head: Option<Rc<RefCell<ListNode<T>>>>,
    tail: Option<Rc<RefCell<ListNode<T>>>>,
    len: usize,
}

impl<T: PartialEq> List<T> {
    pub fn new() -> List<T> {
        List { head: None, tail: None, len: 0 }
    }

    /// Add a new node to the list head.
    pub fn add_node_head(&mut self, value: Rc<T>) -> &mut Self {
        let node = Rc::new(RefCell::new(ListNode {
            prev: None,
            next: self.head.take(),
            value: Some(value),
        }));
        if self.len == 0 {
            self.tail = Some(node.clone());
        } else if let Some(next) = node.borrow().next.clone() {
            next.borrow_mut().prev = Some(Rc::downgrade(&node));
        }
        self.head = Some(node);
        self.len += 1;
        self
    }

    /// Add a new node to the list tail.
    pub fn add_node_tail(&mut self, value: Rc<T>) -> &mut Self {
        let node = Rc::new(RefCell::new(ListNode { prev: None, next: None, value: Some(value) }));
        if self.len == 0 {
            self.head = Some(node.clone());
        } else if let Some(tail) = self.tail.clone() {
            tail.borrow_mut().next = Some(node.clone());
            node.borrow_mut().prev = Some(Rc::downgrade(&tail));
        }
        self.tail = Some(node);
        self.len += 1;
        self
    }

    /// Remove the given node. The node must belong to this list.
    pub fn del_node(&mut self, node: Rc<RefCell<ListNode<T>>>) {
        let prev = node.borrow().prev();
        let next = node.borrow().next();

        match &prev {
            Some(p) => p.borrow_mut().next = next.clone(),
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => n.borrow_mut().prev = prev.as_ref().map(Rc::downgrade),
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub fn search_key(&self, key: &T) -> Option<Rc<RefCell<ListNode<T>>>> {
        let mut cur = self.head.clone();
        while let Some(node) = cur {
            if let Some(v) = node.borrow().value() {
                if v.as_ref() == key {
                    return Some(node);
                }
            }
            cur = node.borrow().next();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<Rc<RefCell<ListNode<T>>>> {
        self.head.clone()
    }

    pub fn last(&self) -> Option<Rc<RefCell<ListNode<T>>>> {
        self.tail.clone()
    }
}

impl<T: PartialEq> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_tail_track_through_mutation() {
        let mut list: List<i32> = List::new();
        list.add_node_tail(Rc::new(1));
        list.add_node_tail(Rc::new(2));
        list.add_node_head(Rc::new(0));
        assert_eq!(list.len(), 3);
        assert_eq!(*list.first().unwrap().borrow().value().unwrap(), 0);
        assert_eq!(*list.last().unwrap().borrow().value().unwrap(), 2);
    }

    #[test]
    fn delete_head_tail_interior_preserve_links() {
        let mut list: List<i32> = List::new();
        list.add_node_tail(Rc::new(1));
        list.add_node_tail(Rc::new(2));
        list.add_node_tail(Rc::new(3));

        let mid = list.search_key(&2).unwrap();
        list.del_node(mid);
        assert_eq!(list.len(), 2);
        assert_eq!(*list.first().unwrap().borrow().value().unwrap(), 1);
        assert_eq!(*list.last().unwrap().borrow().value().unwrap(), 3);

        let head = list.first().unwrap();
        list.del_node(head);
        assert_eq!(list.len(), 1);
        assert_eq!(*list.first().unwrap().borrow().value().unwrap(), 3);

        let tail = list.last().unwrap();
        list.del_node(tail);
        assert_eq!(list.len(), 0);
        assert!(list.first().is_none());
        assert!(list.last().is_none());
    }

    #[test]
    fn length_matches_successful_mutations() {
        let mut list: List<i32> = List::new();
        for i in 0..5 {
            list.add_node_tail(Rc::new(i));
        }
        assert_eq!(list.len(), 5);
        let n = list.search_key(&2).unwrap();
        list.del_node(n);
        assert_eq!(list.len(), 4);
    }
}
