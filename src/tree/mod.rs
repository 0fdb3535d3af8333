//! The Bayes tree: a directed tree of cliques of Gaussian conditionals.
//!
//! Each clique holds the conditional `p(F | S)` over its frontal variables
//! given its separator, plus the cached marginal factor its descendants
//! passed up when the clique was eliminated. The product of all conditionals
//! equals the elimination of the current linearized factor graph, and every
//! separator variable appears as a frontal in exactly one strict ancestor.
//!
//! Ownership follows the tree: children are owned by their parent (roots by
//! the tree), and child→parent links are non-owning `Weak` references. Deep
//! copy walks top-down and re-threads the parent pointers into the copy.

use nalgebra::DVector;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::{Rc, Weak};

use crate::linalg::{EliminationResult, GaussianConditional, HessianFactor};

/// Shared handle to a clique.
pub type SharedClique = Rc<RefCell<Clique>>;

/// A node of the Bayes tree.
#[derive(Debug)]
pub struct Clique {
    conditional: GaussianConditional,
    cached: Option<HessianFactor>,
    gradient: DVector<f64>,
    parent: Weak<RefCell<Clique>>,
    children: Vec<SharedClique>,
}

impl Clique {
    /// Create a detached clique from a conditional and its cached marginal.
    pub fn new(conditional: GaussianConditional, cached: Option<HessianFactor>) -> SharedClique {
        let gradient = conditional.gradient_at_zero();
        Rc::new(RefCell::new(Clique {
            conditional,
            cached,
            gradient,
            parent: Weak::new(),
            children: Vec::new(),
        }))
    }

    /// The clique conditional `p(F | S)`.
    pub fn conditional(&self) -> &GaussianConditional {
        &self.conditional
    }

    /// The cached separator marginal passed up from this clique's subtree.
    /// Empty for root cliques.
    pub fn cached(&self) -> Option<&HessianFactor> {
        self.cached.as_ref()
    }

    /// Gradient of this clique's quadratic at the origin, spanning frontal
    /// then separator columns.
    pub fn gradient_contribution(&self) -> &DVector<f64> {
        &self.gradient
    }

    /// Frontal variable indices.
    pub fn frontals(&self) -> &[usize] {
        self.conditional.frontals()
    }

    /// Separator variable indices.
    pub fn separator(&self) -> &[usize] {
        self.conditional.separator()
    }

    /// Parent clique, if any.
    pub fn parent(&self) -> Option<SharedClique> {
        self.parent.upgrade()
    }

    /// Child cliques.
    pub fn children(&self) -> &[SharedClique] {
        &self.children
    }

    /// Replace the conditional, refreshing the cached gradient contribution.
    fn set_conditional(&mut self, conditional: GaussianConditional) {
        self.gradient = conditional.gradient_at_zero();
        self.conditional = conditional;
    }

    /// Rewrite every variable label in the subtree through `perm`
    /// (label k becomes perm[k]). Structure and numbers are untouched.
    pub fn permute_with_inverse(clique: &SharedClique, perm: &[usize]) {
        {
            let mut node = clique.borrow_mut();
            node.conditional.relabel(perm);
            if let Some(cached) = node.cached.as_mut() {
                cached.relabel(perm);
            }
        }
        let children = clique.borrow().children.clone();
        for child in children {
            Clique::permute_with_inverse(&child, perm);
        }
    }

    /// Deep copy of the subtree rooted here, with `parent` as the copy's
    /// parent link.
    fn clone_subtree(clique: &SharedClique, parent: Weak<RefCell<Clique>>) -> SharedClique {
        let source = clique.borrow();
        let copy = Rc::new(RefCell::new(Clique {
            conditional: source.conditional.clone(),
            cached: source.cached.clone(),
            gradient: source.gradient.clone(),
            parent,
            children: Vec::new(),
        }));
        let children = source
            .children
            .iter()
            .map(|child| Clique::clone_subtree(child, Rc::downgrade(&copy)))
            .collect();
        copy.borrow_mut().children = children;
        copy
    }

    fn structural_eq(a: &SharedClique, b: &SharedClique) -> bool {
        let a = a.borrow();
        let b = b.borrow();
        a.conditional == b.conditional
            && a.cached == b.cached
            && a.children.len() == b.children.len()
            && a.children
                .iter()
                .zip(b.children.iter())
                .all(|(x, y)| Clique::structural_eq(x, y))
    }
}

/// Directed clique tree addressed by a nodes map from variable index to the
/// clique holding it as a frontal.
#[derive(Debug, Default)]
pub struct BayesTree {
    roots: Vec<SharedClique>,
    nodes: HashMap<usize, SharedClique>,
}

impl BayesTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tree has no cliques.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Root cliques.
    pub fn roots(&self) -> &[SharedClique] {
        &self.roots
    }

    /// The clique whose frontal set contains `index`, if any.
    pub fn clique_of(&self, index: usize) -> Option<&SharedClique> {
        self.nodes.get(&index)
    }

    /// All cliques, top-down.
    pub fn cliques(&self) -> Vec<SharedClique> {
        let mut all = Vec::new();
        let mut stack: Vec<SharedClique> = self.roots.clone();
        while let Some(clique) = stack.pop() {
            stack.extend(clique.borrow().children.iter().cloned());
            all.push(clique);
        }
        all
    }

    /// Number of cliques.
    pub fn num_cliques(&self) -> usize {
        self.cliques().len()
    }

    /// Link a single clique under `parent` (`None` makes it a root) and index
    /// its frontals in the nodes map.
    pub fn attach(&mut self, clique: SharedClique, parent: Option<&SharedClique>) {
        match parent {
            Some(parent) => {
                clique.borrow_mut().parent = Rc::downgrade(parent);
                parent.borrow_mut().children.push(clique.clone());
            }
            None => {
                clique.borrow_mut().parent = Weak::new();
                self.roots.push(clique.clone());
            }
        }
        for &frontal in clique.borrow().frontals() {
            self.nodes.insert(frontal, clique.clone());
        }
    }

    /// Link a whole subtree under `parent`, indexing every clique in it.
    pub fn attach_subtree(&mut self, root: SharedClique, parent: Option<&SharedClique>) {
        match parent {
            Some(parent) => {
                root.borrow_mut().parent = Rc::downgrade(parent);
                parent.borrow_mut().children.push(root.clone());
            }
            None => {
                root.borrow_mut().parent = Weak::new();
                self.roots.push(root.clone());
            }
        }
        let mut stack = vec![root];
        while let Some(clique) = stack.pop() {
            stack.extend(clique.borrow().children.iter().cloned());
            for &frontal in clique.borrow().frontals() {
                self.nodes.insert(frontal, clique.clone());
            }
        }
    }

    /// Sever `clique` from its parent (or the root list) and drop the nodes
    /// entries of its whole subtree, returning the detached cliques.
    pub fn detach(&mut self, clique: &SharedClique) -> Vec<SharedClique> {
        let parent = clique.borrow().parent();
        match parent {
            Some(parent) => parent
                .borrow_mut()
                .children
                .retain(|child| !Rc::ptr_eq(child, clique)),
            None => self.roots.retain(|root| !Rc::ptr_eq(root, clique)),
        }
        clique.borrow_mut().parent = Weak::new();

        let mut detached = Vec::new();
        let mut stack = vec![clique.clone()];
        while let Some(node) = stack.pop() {
            stack.extend(node.borrow().children.iter().cloned());
            for frontal in node.borrow().frontals() {
                self.nodes.remove(frontal);
            }
            detached.push(node);
        }
        detached
    }

    /// The affected sub-tree: every clique whose frontals intersect `marked`,
    /// plus every ancestor on a path to a root. The result order follows the
    /// sorted marked set, so it is deterministic.
    pub fn find_all(&self, marked: &BTreeSet<usize>) -> Vec<SharedClique> {
        let mut seen: HashSet<*const RefCell<Clique>> = HashSet::new();
        let mut found = Vec::new();
        for &index in marked {
            let mut current = self.nodes.get(&index).cloned();
            while let Some(clique) = current {
                if !seen.insert(Rc::as_ptr(&clique)) {
                    break;
                }
                current = clique.borrow().parent();
                found.push(clique);
            }
        }
        found
    }

    /// Rewrite every variable label in the tree through `perm` (label k
    /// becomes perm[k]) and rebuild the nodes map. Structure is preserved;
    /// only labels change.
    pub fn permute_with_inverse(&mut self, perm: &[usize]) {
        for root in &self.roots {
            Clique::permute_with_inverse(root, perm);
        }
        self.reindex();
    }

    /// Rebuild the nodes map from the current labels.
    fn reindex(&mut self) {
        self.nodes.clear();
        for clique in self.cliques() {
            for &frontal in clique.borrow().frontals() {
                self.nodes.insert(frontal, clique.clone());
            }
        }
    }

    /// Assemble a replacement sub-tree from the conditionals and recorded
    /// marginals of an elimination, in reverse elimination order.
    ///
    /// A conditional whose parent set equals the frontals ∪ separator of the
    /// clique holding its first-eliminated parent is merged into that clique
    /// (prepended); otherwise it starts a child clique whose cached factor is
    /// the marginal recorded when its frontal was eliminated.
    pub fn assemble_subtree(elimination: EliminationResult) -> Vec<SharedClique> {
        let EliminationResult {
            bayes_net,
            mut marginals,
        } = elimination;

        let mut nodes: HashMap<usize, SharedClique> = HashMap::new();
        let mut roots = Vec::new();

        let conditionals = bayes_net.into_conditionals();
        for (position, conditional) in conditionals.into_iter().enumerate().rev() {
            let frontal = conditional.frontals()[0];
            if conditional.separator().is_empty() {
                let clique = Clique::new(conditional, None);
                nodes.insert(frontal, clique.clone());
                roots.push(clique);
                continue;
            }

            let first_parent = *conditional.separator().iter().min().unwrap();
            let parent = nodes
                .get(&first_parent)
                .expect("separator variable eliminated before its conditional")
                .clone();

            let mergeable = {
                let node = parent.borrow();
                let mut scope: Vec<usize> = node.conditional.frontals().to_vec();
                scope.extend_from_slice(node.conditional.separator());
                conditional.separator() == scope.as_slice()
            };

            if mergeable {
                let merged = parent.borrow().conditional.merge_prepend(&conditional);
                parent.borrow_mut().set_conditional(merged);
                nodes.insert(frontal, parent);
            } else {
                let cached = marginals[position].take();
                let clique = Clique::new(conditional, cached);
                clique.borrow_mut().parent = Rc::downgrade(&parent);
                parent.borrow_mut().children.push(clique.clone());
                nodes.insert(frontal, clique);
            }
        }

        roots
    }
}

impl Clone for BayesTree {
    fn clone(&self) -> Self {
        let roots: Vec<SharedClique> = self
            .roots
            .iter()
            .map(|root| Clique::clone_subtree(root, Weak::new()))
            .collect();
        let mut copy = BayesTree {
            roots,
            nodes: HashMap::new(),
        };
        copy.reindex();
        copy
    }
}

impl PartialEq for BayesTree {
    fn eq(&self, other: &Self) -> bool {
        self.roots.len() == other.roots.len()
            && self
                .roots
                .iter()
                .zip(other.roots.iter())
                .all(|(a, b)| Clique::structural_eq(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn scalar_conditional(
        frontal: usize,
        separator: Vec<usize>,
        r: f64,
        s_values: &[f64],
        d: f64,
    ) -> GaussianConditional {
        let sdim = separator.len();
        GaussianConditional::new(
            vec![frontal],
            vec![1],
            separator,
            vec![1; sdim],
            DMatrix::from_element(1, 1, r),
            DMatrix::from_row_slice(1, sdim, s_values),
            DVector::from_element(1, d),
            DVector::from_element(1, 1.0),
        )
    }

    fn scalar_cached(key: usize, g: f64) -> HessianFactor {
        let mut info = DMatrix::zeros(2, 2);
        info[(0, 0)] = g;
        info[(0, 1)] = 1.0;
        info[(1, 0)] = 1.0;
        info[(1, 1)] = 1.0;
        HessianFactor::new(vec![key], vec![1], info)
    }

    /// A three-clique chain: root [3,4], then [2|3], then [0|2].
    fn chain_tree() -> BayesTree {
        let mut tree = BayesTree::new();
        let root = {
            let inner = scalar_conditional(4, vec![], 2.0, &[], 1.0);
            let front = scalar_conditional(3, vec![4], 1.0, &[2.0], 1.0);
            Clique::new(inner.merge_prepend(&front), None)
        };
        tree.attach(root.clone(), None);

        let mid = Clique::new(
            scalar_conditional(2, vec![3], 1.0, &[2.0], 1.0),
            Some(scalar_cached(3, 1.0)),
        );
        tree.attach(mid.clone(), Some(&root));

        let leaf = Clique::new(
            scalar_conditional(0, vec![2], 1.0, &[2.0], 1.0),
            Some(scalar_cached(2, 1.0)),
        );
        tree.attach(leaf, Some(&mid));
        tree
    }

    #[test]
    fn test_nodes_map_addresses_frontals() {
        let tree = chain_tree();
        assert_eq!(tree.num_cliques(), 3);
        // 3 and 4 share the root clique
        assert!(Rc::ptr_eq(
            tree.clique_of(3).unwrap(),
            tree.clique_of(4).unwrap()
        ));
        assert!(tree.clique_of(1).is_none());
    }

    #[test]
    fn test_find_all_pulls_ancestors() {
        let tree = chain_tree();
        let found = tree.find_all(&BTreeSet::from([0]));
        // The clique of 0 plus both ancestors
        assert_eq!(found.len(), 3);

        let found = tree.find_all(&BTreeSet::from([2]));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_detach_returns_subtree_and_clears_nodes() {
        let mut tree = chain_tree();
        let mid = tree.clique_of(2).unwrap().clone();
        let detached = tree.detach(&mid);
        assert_eq!(detached.len(), 2);
        assert!(tree.clique_of(2).is_none());
        assert!(tree.clique_of(0).is_none());
        assert!(tree.clique_of(3).is_some());
        assert_eq!(tree.num_cliques(), 1);
    }

    /// Relabeling rewrites conditionals and cached factors but preserves
    /// structure; a bijective round trip is the identity.
    #[test]
    fn test_permute_with_inverse_roundtrip() {
        let mut tree = chain_tree();
        let reference = tree.clone();

        let mut perm: Vec<usize> = (0..5).collect();
        perm.swap(2, 1);
        tree.permute_with_inverse(&perm);
        assert!(tree != reference);
        // 2 became 1
        assert!(tree.clique_of(1).is_some());
        assert_eq!(
            tree.clique_of(1)
                .unwrap()
                .borrow()
                .cached()
                .unwrap()
                .keys(),
            &[3]
        );

        let mut inverse: Vec<usize> = (0..5).collect();
        inverse.swap(2, 1);
        tree.permute_with_inverse(&inverse);
        assert!(tree == reference);
    }

    #[test]
    fn test_clone_is_deep() {
        let tree = chain_tree();
        let copy = tree.clone();
        assert!(tree == copy);
        // Parent pointers are re-threaded into the copy
        let leaf = copy.clique_of(0).unwrap().clone();
        let parent = leaf.borrow().parent().unwrap();
        assert!(Rc::ptr_eq(&parent, copy.clique_of(2).unwrap()));
        assert!(!Rc::ptr_eq(&parent, tree.clique_of(2).unwrap()));
    }
}
