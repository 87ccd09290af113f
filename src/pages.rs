//! The page tree manager: an ordered page list maintained over /Pages,
//! with the repair rules damaged files need.

use std::collections::HashSet;

use crate::copier::ForeignCopier;
use crate::error::ErrorKind;
use crate::{Dictionary, Document, Error, Object, ObjectId, Result};

/// Letter-size fallback for pages without a /MediaBox anywhere in their
/// inheritance chain.
const LETTER_MEDIA_BOX: [i64; 4] = [0, 0, 612, 792];

/// The attributes a /Pages node passes down to its descendants.
const INHERITED_KEYS: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

impl Document {
    /// The ordered page list: position i maps to the i-th leaf of a
    /// depth-first /Kids traversal. The cache is rebuilt on first access
    /// and after [`invalidate_page_cache`].
    ///
    /// [`invalidate_page_cache`]: Document::invalidate_page_cache
    pub fn get_pages(&mut self) -> Result<Vec<ObjectId>> {
        if self.page_cache.is_none() {
            self.rebuild_page_cache()?;
        }
        Ok(self.page_cache.clone().unwrap_or_default())
    }

    pub fn page_count(&mut self) -> Result<usize> {
        Ok(self.get_pages()?.len())
    }

    /// Drop the cached list after mutating the tree outside this API.
    pub fn invalidate_page_cache(&mut self) {
        self.page_cache = None;
    }

    /// Position of a page in the page list.
    pub fn find_page(&mut self, page: ObjectId) -> Result<usize> {
        self.get_pages()?
            .iter()
            .position(|candidate| *candidate == page)
            .ok_or_else(|| Error::Pages(format!("object {} {} is not a page of this document", page.0, page.1)))
    }

    /// Insert an (already local) page object at `position`, clamping to the
    /// end. Flattens the tree on first mutation.
    pub fn insert_page(&mut self, page: ObjectId, position: usize) -> Result<()> {
        self.flatten_page_tree()?;
        let root_id = self.pages_root_id()?;
        self.get_dictionary_mut(page)?.set("Parent", Object::Reference(root_id));
        let mut pages = self.get_pages()?;
        let position = position.min(pages.len());
        pages.insert(position, page);
        self.write_flat_kids(&pages)?;
        self.page_cache = Some(pages);
        Ok(())
    }

    /// Copy a page from another document (through `copier`, which keeps
    /// shared resources shared) and insert it at `position`.
    pub fn insert_foreign_page(
        &mut self,
        source: &Document,
        copier: &mut ForeignCopier,
        foreign_page: ObjectId,
        position: usize,
    ) -> Result<ObjectId> {
        let local = copier.copy_object(self, source, foreign_page)?;
        self.insert_page(local, position)?;
        Ok(local)
    }

    /// Remove a page from the tree. The object itself stays in the table.
    pub fn remove_page(&mut self, page: ObjectId) -> Result<()> {
        self.flatten_page_tree()?;
        let mut pages = self.get_pages()?;
        let position = pages
            .iter()
            .position(|candidate| *candidate == page)
            .ok_or_else(|| Error::Pages(format!("object {} {} is not a page of this document", page.0, page.1)))?;
        pages.remove(position);
        self.write_flat_kids(&pages)?;
        self.page_cache = Some(pages);
        Ok(())
    }

    /// Push inherited attributes to the leaves and replace the root /Kids
    /// with the flat page list.
    pub fn flatten_page_tree(&mut self) -> Result<()> {
        if self.pages_flattened {
            return Ok(());
        }
        self.push_inherited_attributes()?;
        let pages = self.get_pages()?;
        self.write_flat_kids(&pages)?;
        let root_id = self.pages_root_id()?;
        for page in &pages {
            self.get_dictionary_mut(*page)?.set("Parent", Object::Reference(root_id));
        }
        self.pages_flattened = true;
        Ok(())
    }

    /// Copy /MediaBox, /CropBox, /Resources and /Rotate from intermediate
    /// nodes down to every leaf that does not override them.
    pub fn push_inherited_attributes(&mut self) -> Result<()> {
        if self.page_cache.is_none() {
            self.rebuild_page_cache()?;
        }
        let root_id = self.pages_root_id()?;
        let mut visiting = HashSet::new();
        self.push_inherited_walk(root_id, &Dictionary::new(), &mut visiting)
    }

    fn push_inherited_walk(
        &mut self,
        node_id: ObjectId,
        inherited: &Dictionary,
        visiting: &mut HashSet<ObjectId>,
    ) -> Result<()> {
        if !visiting.insert(node_id) {
            return Ok(());
        }
        let node = self.get_dictionary(node_id)?;
        let is_leaf = !node.has(b"Kids") && !node.has_type(b"Pages");

        let mut passed_down = inherited.clone();
        for key in INHERITED_KEYS {
            if let Ok(value) = node.get(key) {
                passed_down.set(key.to_vec(), value.clone());
            }
        }

        if is_leaf {
            let node = self.get_dictionary_mut(node_id)?;
            for key in INHERITED_KEYS {
                if !node.has(key) {
                    if let Ok(value) = passed_down.get(key) {
                        node.set(key.to_vec(), value.clone());
                    }
                }
            }
        } else {
            let kids: Vec<ObjectId> = node
                .get_or_null(b"Kids")
                .as_array()
                .map(|kids| kids.iter().filter_map(|kid| kid.as_reference().ok()).collect())
                .unwrap_or_default();
            for kid in kids {
                self.push_inherited_walk(kid, &passed_down, visiting)?;
            }
            // The attributes now live on the leaves.
            let node = self.get_dictionary_mut(node_id)?;
            for key in INHERITED_KEYS {
                node.remove(key);
            }
        }
        visiting.remove(&node_id);
        Ok(())
    }

    /// The root /Pages node, promoting a direct dictionary to indirect and
    /// interposing a node when the catalog points straight at a leaf.
    fn pages_root_id(&mut self) -> Result<ObjectId> {
        let pages_entry = self.catalog()?.get(b"Pages").ok().cloned();
        match pages_entry {
            Some(Object::Reference(id)) => {
                let target = self.get_dictionary(id)?;
                if !target.has(b"Kids") && target.has_type(b"Page") {
                    // A root pointing at a leaf gets a node interposed.
                    let node = self.add_object(Object::Dictionary(Dictionary::from_iter([
                        ("Type", Object::Name(b"Pages".to_vec())),
                        ("Kids", Object::Array(vec![Object::Reference(id)])),
                        ("Count", Object::Integer(1)),
                    ])));
                    self.catalog_mut()?.set("Pages", Object::Reference(node));
                    self.get_dictionary_mut(id)?.set("Parent", Object::Reference(node));
                    self.warn(
                        ErrorKind::Pages,
                        format!("object {} {}", id.0, id.1),
                        None,
                        "catalog /Pages pointed at a page, interposing a tree node".to_string(),
                    )?;
                    self.page_cache = None;
                    return Ok(node);
                }
                Ok(id)
            }
            Some(Object::Dictionary(dict)) => {
                let id = self.add_object(Object::Dictionary(dict));
                self.catalog_mut()?.set("Pages", Object::Reference(id));
                self.warn(
                    ErrorKind::Pages,
                    String::new(),
                    None,
                    "catalog /Pages was a direct dictionary, promoted to indirect".to_string(),
                )?;
                self.page_cache = None;
                Ok(id)
            }
            _ => Err(Error::Pages("the catalog has no usable /Pages entry".to_string())),
        }
    }

    fn write_flat_kids(&mut self, pages: &[ObjectId]) -> Result<()> {
        let root_id = self.pages_root_id()?;
        let kids: Vec<Object> = pages.iter().map(|id| Object::Reference(*id)).collect();
        let root = self.get_dictionary_mut(root_id)?;
        root.set("Type", Object::Name(b"Pages".to_vec()));
        root.set("Kids", Object::Array(kids));
        root.set("Count", pages.len() as i64);
        Ok(())
    }

    fn rebuild_page_cache(&mut self) -> Result<()> {
        let root_id = self.pages_root_id()?;
        let mut pages = Vec::new();
        let mut path = HashSet::new();
        let mut seen = HashSet::new();
        self.walk_pages_node(root_id, &mut path, &mut pages, &mut seen)?;
        self.page_cache = Some(pages);
        Ok(())
    }

    fn walk_pages_node(
        &mut self,
        node_id: ObjectId,
        path: &mut HashSet<ObjectId>,
        pages: &mut Vec<ObjectId>,
        seen: &mut HashSet<ObjectId>,
    ) -> Result<()> {
        if !path.insert(node_id) {
            self.warn(
                ErrorKind::Pages,
                format!("object {} {}", node_id.0, node_id.1),
                None,
                "loop in the page tree, ignoring the repeated node".to_string(),
            )?;
            return Ok(());
        }

        let node = self.get_dictionary(node_id)?;
        if !node.has_type(b"Pages") {
            self.warn(
                ErrorKind::Pages,
                format!("object {} {}", node_id.0, node_id.1),
                None,
                "page tree node has a wrong /Type, repairing to /Pages".to_string(),
            )?;
            self.get_dictionary_mut(node_id)?
                .set("Type", Object::Name(b"Pages".to_vec()));
        }

        let kids = self
            .get_dictionary(node_id)?
            .get_or_null(b"Kids")
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut fixed_kids: Vec<Object> = Vec::with_capacity(kids.len());
        let mut kids_changed = false;

        for kid in kids {
            let kid_id = match kid {
                Object::Reference(id) => id,
                Object::Dictionary(ref dict) => {
                    // Pages must be indirect so they can be referenced.
                    let promoted = self.add_object(Object::Dictionary(dict.clone()));
                    self.warn(
                        ErrorKind::Pages,
                        format!("object {} {}", promoted.0, promoted.1),
                        None,
                        "direct page object promoted to indirect".to_string(),
                    )?;
                    kids_changed = true;
                    promoted
                }
                other => {
                    self.warn(
                        ErrorKind::Pages,
                        format!("object {} {}", node_id.0, node_id.1),
                        None,
                        format!("ignoring a {} in /Kids", other.type_name()),
                    )?;
                    kids_changed = true;
                    continue;
                }
            };

            let Ok(kid_dict) = self.get_dictionary(kid_id) else {
                self.warn(
                    ErrorKind::Pages,
                    format!("object {} {}", kid_id.0, kid_id.1),
                    None,
                    "kid is not a dictionary, dropping it from the tree".to_string(),
                )?;
                kids_changed = true;
                continue;
            };

            if kid_dict.has(b"Kids") || kid_dict.has_type(b"Pages") {
                fixed_kids.push(Object::Reference(kid_id));
                self.walk_pages_node(kid_id, path, pages, seen)?;
                continue;
            }

            // A leaf.
            self.repair_page_leaf(kid_id, node_id)?;
            if seen.contains(&kid_id) {
                if self.xref_reconstructed {
                    // After reconstruction a repeated page is most likely
                    // the same object found twice; drop the duplicate.
                    self.warn(
                        ErrorKind::Pages,
                        format!("object {} {}", kid_id.0, kid_id.1),
                        None,
                        "page appears twice in the tree, dropping the duplicate".to_string(),
                    )?;
                    kids_changed = true;
                    continue;
                }
                let copy = self.get_dictionary(kid_id)?.clone();
                let copy_id = self.add_object(Object::Dictionary(copy));
                self.warn(
                    ErrorKind::Pages,
                    format!("object {} {}", kid_id.0, kid_id.1),
                    None,
                    format!("page appears twice in the tree, copied to {} {}", copy_id.0, copy_id.1),
                )?;
                kids_changed = true;
                fixed_kids.push(Object::Reference(copy_id));
                seen.insert(copy_id);
                pages.push(copy_id);
                continue;
            }
            fixed_kids.push(Object::Reference(kid_id));
            seen.insert(kid_id);
            pages.push(kid_id);
        }

        if kids_changed {
            self.get_dictionary_mut(node_id)?.set("Kids", Object::Array(fixed_kids));
        }
        path.remove(&node_id);
        Ok(())
    }

    fn repair_page_leaf(&mut self, page_id: ObjectId, _parent: ObjectId) -> Result<()> {
        let page = self.get_dictionary(page_id)?;
        let needs_type = !page.has_type(b"Page");
        let needs_media_box = !page.has(b"MediaBox") && !self.page_inherits(page_id, b"MediaBox");
        let needs_resources = !page.has(b"Resources") && !self.page_inherits(page_id, b"Resources");

        if needs_type {
            self.warn(
                ErrorKind::Pages,
                format!("object {} {}", page_id.0, page_id.1),
                None,
                "page has a wrong /Type, repairing to /Page".to_string(),
            )?;
            self.get_dictionary_mut(page_id)?
                .set("Type", Object::Name(b"Page".to_vec()));
        }
        if needs_media_box {
            self.warn(
                ErrorKind::Pages,
                format!("object {} {}", page_id.0, page_id.1),
                None,
                "page has no /MediaBox, falling back to letter size".to_string(),
            )?;
            self.get_dictionary_mut(page_id)?.set(
                "MediaBox",
                Object::Array(LETTER_MEDIA_BOX.iter().map(|v| Object::Integer(*v)).collect()),
            );
        }
        if needs_resources {
            self.get_dictionary_mut(page_id)?
                .set("Resources", Object::Dictionary(Dictionary::new()));
        }
        Ok(())
    }

    /// Whether `key` is available through the page's /Parent chain.
    fn page_inherits(&self, page_id: ObjectId, key: &[u8]) -> bool {
        let mut seen = HashSet::new();
        let mut current = page_id;
        loop {
            if !seen.insert(current) {
                return false;
            }
            let Ok(dict) = self.get_dictionary(current) else {
                return false;
            };
            if current != page_id && dict.has(key) {
                return true;
            }
            match dict.get(b"Parent").and_then(Object::as_reference) {
                Ok(parent) => current = parent,
                Err(_) => return false,
            }
        }
    }
}
