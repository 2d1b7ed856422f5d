//! Links descriptors into a directed acyclic graph, where an edge means "must be ready before".
//! The topological order is stable: resources that don't depend on one another are always
//! ordered by their declaration index, so that runs are reproducible.
use crate::error::{ProvisionError, ReferenceFailure, ValidationError};
use crate::resource::ResourceDescriptor;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// in declaration order
    descriptors: Vec<ResourceDescriptor>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph and computes the apply order. The checks happen in a fixed order:
    /// duplicate names, undeclared dependencies, cycles, and finally that every placeholder
    /// refers to a transitive dependency of the resource that contains it.
    pub fn build(descriptors: Vec<ResourceDescriptor>) -> Result<DependencyGraph, ProvisionError> {
        let index = index_names(&descriptors)?;

        let mut dependencies = vec![Vec::new(); descriptors.len()];
        let mut dependents = vec![Vec::new(); descriptors.len()];
        for (i, desc) in descriptors.iter().enumerate() {
            for dep_name in desc.depends_on.iter() {
                let dep = *index.get(dep_name.as_str()).ok_or_else(|| {
                    ProvisionError::UnresolvedDependency {
                        resource: desc.name.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;
                if !dependencies[i].contains(&dep) {
                    dependencies[i].push(dep);
                    dependents[dep].push(i);
                }
            }
        }

        let order = topological_order(&dependencies, &dependents).map_err(|remaining| {
            let cycle = find_cycle(&dependencies, &remaining)
                .into_iter()
                .map(|i| descriptors[i].name.clone())
                .collect();
            ProvisionError::CycleDetected { cycle }
        })?;

        let graph = DependencyGraph {
            descriptors,
            index,
            dependencies,
            dependents,
            order,
        };
        graph.check_references()?;
        log::debug!("Computed apply order: {:?}", graph.names_in_order());
        Ok(graph)
    }

    /// Descriptors in apply order
    pub fn order(&self) -> impl Iterator<Item = &ResourceDescriptor> + '_ {
        self.order.iter().map(move |i| &self.descriptors[*i])
    }

    pub fn names_in_order(&self) -> Vec<&str> {
        self.order().map(|d| d.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.index.get(name).map(|i| &self.descriptors[*i])
    }

    /// The direct dependencies of the named resource, in declaration order
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.names(self.index.get(name).map(|i| self.dependencies[*i].as_slice()))
    }

    /// The resources that directly depend on the named resource
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.names(self.index.get(name).map(|i| self.dependents[*i].as_slice()))
    }

    /// Every resource that transitively depends on the named resource, in apply order
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        let start = match self.index.get(name) {
            Some(i) => *i,
            None => return Vec::new(),
        };
        let reachable = self.descendant_indices(start);
        self.order
            .iter()
            .filter(|i| reachable.contains(*i))
            .map(|i| self.descriptors[*i].name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn descriptor_at(&self, index: usize) -> &ResourceDescriptor {
        &self.descriptors[index]
    }

    pub(crate) fn order_indices(&self) -> &[usize] {
        self.order.as_slice()
    }

    pub(crate) fn dependency_indices(&self, index: usize) -> &[usize] {
        self.dependencies[index].as_slice()
    }

    pub(crate) fn descendant_indices(&self, start: usize) -> HashSet<usize> {
        reachable(&self.dependents, start)
    }

    fn ancestor_indices(&self, start: usize) -> HashSet<usize> {
        reachable(&self.dependencies, start)
    }

    fn names(&self, indices: Option<&[usize]>) -> Vec<&str> {
        indices
            .unwrap_or(&[])
            .iter()
            .map(|i| self.descriptors[*i].name.as_str())
            .collect()
    }

    fn check_references(&self) -> Result<(), ProvisionError> {
        for i in self.order.iter().copied() {
            let desc = &self.descriptors[i];
            let references = desc.references();
            if references.is_empty() {
                continue;
            }
            let ancestors = self.ancestor_indices(i);
            for reference in references {
                let reason = match self.index.get(reference.resource.as_str()) {
                    None => Some(ReferenceFailure::UnknownResource),
                    Some(target) if !ancestors.contains(target) => {
                        Some(ReferenceFailure::NotADependency)
                    }
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    return Err(ProvisionError::UnresolvedReference {
                        resource: desc.name.clone(),
                        reference,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }
}

fn index_names(descriptors: &[ResourceDescriptor]) -> Result<HashMap<String, usize>, ProvisionError> {
    let mut index = HashMap::with_capacity(descriptors.len());
    let mut errors = Vec::new();
    for (i, desc) in descriptors.iter().enumerate() {
        if index.contains_key(desc.name.as_str()) {
            let already_reported = errors.iter().any(|e: &ValidationError| e.subject() == desc.name);
            if !already_reported {
                errors.push(ValidationError::DuplicateName {
                    name: desc.name.clone(),
                });
            }
        } else {
            index.insert(desc.name.clone(), i);
        }
    }
    if errors.is_empty() {
        Ok(index)
    } else {
        Err(ProvisionError::Validation(errors))
    }
}

/// Kahn's algorithm, always picking the ready node with the lowest declaration index. Returns
/// the nodes that could not be ordered if there's a cycle.
fn topological_order(
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, HashSet<usize>> {
    let mut remaining_deps = dependencies.iter().map(Vec::len).collect::<Vec<_>>();
    let mut ready = remaining_deps
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse(i))
        .collect::<BinaryHeap<_>>();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(next)) = ready.pop() {
        order.push(next);
        for dependent in dependents[next].iter().copied() {
            remaining_deps[dependent] -= 1;
            if remaining_deps[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() == dependencies.len() {
        Ok(order)
    } else {
        let ordered = order.into_iter().collect::<HashSet<_>>();
        Err((0..dependencies.len()).filter(|i| !ordered.contains(i)).collect())
    }
}

/// Every node left over after Kahn's algorithm still has at least one unordered dependency, so
/// following those edges from any of them must eventually loop. Returns the loop with its first
/// node repeated at the end.
fn find_cycle(dependencies: &[Vec<usize>], remaining: &HashSet<usize>) -> Vec<usize> {
    let start = match remaining.iter().min() {
        Some(s) => *s,
        None => return Vec::new(),
    };
    let mut path = vec![start];
    let mut position = HashMap::new();
    position.insert(start, 0usize);

    let mut current = start;
    loop {
        let next = dependencies[current]
            .iter()
            .copied()
            .find(|dep| remaining.contains(dep));
        let next = match next {
            Some(n) => n,
            None => return path,
        };
        if let Some(pos) = position.get(&next) {
            let mut cycle = path.split_off(*pos);
            cycle.push(next);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

fn reachable(edges: &[Vec<usize>], start: usize) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut queue = edges[start].iter().copied().collect::<VecDeque<_>>();
    while let Some(next) = queue.pop_front() {
        if seen.insert(next) {
            queue.extend(edges[next].iter().copied());
        }
    }
    seen
}
