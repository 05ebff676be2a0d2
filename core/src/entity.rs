use crate::ast::{EntityDecl, MethodDef};
use crate::runtime::{Instance, InstanceRef, Method, RuntimeError, Scope, Value, ENTITY_KEY};

use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Index of an entity in the table. Instances and methods refer to their
/// entity through this rather than a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub usize);

#[derive(Debug)]
pub struct EntityDef {
    pub name: String,
    pub parent: Option<EntityId>,
    pub disowns: bool,
    pub methods: HashMap<String, Rc<Method>>,
}

/// All entities defined during a run, plus the origin table that
/// `ancestor.method()` resolves against.
///
/// `origins[e][m]` holds the body `ancestor.m()` runs when `e` is the
/// executing entity. Entries are only ever added, never replaced, so an
/// override can always reach the body it displaced.
#[derive(Debug, Default)]
pub struct EntityTable {
    entities: Vec<EntityDef>,
    by_name: HashMap<String, EntityId>,
    origins: Vec<HashMap<String, Rc<Method>>>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Result<EntityId, RuntimeError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::UndefinedEntityOrMethod(format!("entity '{}'", name)))
    }

    pub fn get(&self, id: EntityId) -> &EntityDef {
        &self.entities[id.0]
    }

    pub fn name(&self, id: EntityId) -> &str {
        &self.entities[id.0].name
    }

    /// Registers (or redefines) an entity and seeds its origin entries from
    /// the nearest ancestor that defines each method.
    pub fn define(&mut self, decl: &EntityDecl, env: &Scope) -> Result<EntityId, RuntimeError> {
        let parent = match &decl.parent {
            Some(p) => Some(self.lookup(p)?),
            None => None,
        };

        let id = match self.by_name.get(&decl.name) {
            Some(existing) => *existing,
            None => {
                let id = EntityId(self.entities.len());
                self.entities.push(EntityDef {
                    name: decl.name.clone(),
                    parent: None,
                    disowns: false,
                    methods: HashMap::new(),
                });
                self.origins.push(HashMap::new());
                self.by_name.insert(decl.name.clone(), id);
                id
            }
        };

        let methods = decl
            .methods
            .iter()
            .map(|def| (def.name.clone(), Self::make_method(id, def, env)))
            .collect();
        let entry = &mut self.entities[id.0];
        entry.parent = parent;
        entry.disowns = decl.disowns;
        entry.methods = methods;

        for ancestor in self.lineage(id).into_iter().skip(1) {
            for (name, method) in &self.entities[ancestor.0].methods {
                self.origins[id.0]
                    .entry(name.clone())
                    .or_insert_with(|| method.clone());
            }
        }

        debug!(
            entity = %decl.name,
            parent = ?decl.parent,
            disowns = decl.disowns,
            "entity defined"
        );
        Ok(id)
    }

    /// Replaces methods on an existing entity, backing up whatever each one
    /// previously resolved to (own or inherited) if no backup exists yet.
    pub fn alter(
        &mut self,
        target: &str,
        methods: &[Rc<MethodDef>],
        env: &Scope,
    ) -> Result<EntityId, RuntimeError> {
        let id = self.lookup(target)?;
        for def in methods {
            if let Some(previous) = self.resolve(id, &def.name) {
                self.origins[id.0]
                    .entry(def.name.clone())
                    .or_insert(previous);
            }
            let method = Self::make_method(id, def, env);
            self.entities[id.0].methods.insert(def.name.clone(), method);
        }
        debug!(entity = %target, count = methods.len(), "entity altered");
        Ok(id)
    }

    /// `id` followed by its ancestors. The walk includes, then stops at, the
    /// first entity that disowns its parent or has none.
    pub fn lineage(&self, id: EntityId) -> Vec<EntityId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            // a redefinition can close a loop in the parent links
            if chain.contains(&cur) {
                break;
            }
            chain.push(cur);
            let def = &self.entities[cur.0];
            current = if def.disowns { None } else { def.parent };
        }
        chain
    }

    /// The live method `name` as seen by an instance of `id`.
    pub fn resolve(&self, id: EntityId, name: &str) -> Option<Rc<Method>> {
        self.lineage(id)
            .into_iter()
            .find_map(|e| self.entities[e.0].methods.get(name).cloned())
    }

    pub fn origin(&self, context: EntityId, name: &str) -> Result<Rc<Method>, RuntimeError> {
        self.origins[context.0].get(name).cloned().ok_or_else(|| {
            RuntimeError::UndefinedEntityOrMethod(format!(
                "no ancestor method '{}' for entity '{}'",
                name,
                self.name(context)
            ))
        })
    }

    /// Builds a fresh instance holding every visible method, children
    /// shadowing parents.
    pub fn instantiate(&self, name: &str) -> Result<InstanceRef, RuntimeError> {
        let id = self.lookup(name)?;
        let mut fields = IndexMap::new();
        for e in self.lineage(id) {
            for (method_name, method) in &self.entities[e.0].methods {
                fields
                    .entry(method_name.clone())
                    .or_insert_with(|| Value::Method(method.clone()));
            }
        }
        fields.insert(ENTITY_KEY.to_string(), Value::String(name.to_string()));
        Ok(Rc::new(RefCell::new(Instance { entity: id, fields })))
    }

    fn make_method(owner: EntityId, def: &Rc<MethodDef>, env: &Scope) -> Rc<Method> {
        Rc::new(Method {
            owner,
            def: def.clone(),
            env: env.clone(),
        })
    }
}
