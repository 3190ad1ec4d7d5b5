use std::{
    collections::{BTreeMap, HashMap, HashSet, btree_map::Entry},
    sync::Arc,
};

use tracing::trace;
use typed_generational_arena::{StandardArena, StandardIndex};

use super::{
    Arg, IrError, RenameMode, Renames, Type, Var,
    continuation::{Continuation, ContinuationKind},
    instruction::{Instruction, LoopBreak, LoopContinue, rename_var},
};

pub type BlockId = StandardIndex<Block>;
pub type ContId = StandardIndex<Continuation>;

/// What owns a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockParent {
    /// The top level block of a function.
    #[default]
    Function,
    Cont(ContId),
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub parent: BlockParent,
    /// Declarations, visible to the whole block and to inheriting children.
    pub variables: Vec<Var>,
    /// Runs in order.
    pub instructions: Vec<Instruction>,
    /// Unordered.
    pub continuations: Vec<ContId>,
    /// Arrays whose writer count is dropped when the block finishes.
    pub cleanups: Vec<Var>,
}

impl Block {
    pub fn new(parent: BlockParent) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    pub fn declares(&self, var: &Var) -> bool {
        self.variables.contains(var)
    }
}

/// A user function: its interface plus the arenas holding its block tree.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub inputs: Vec<Var>,
    pub outputs: Vec<Var>,
    pub body: BlockId,
    pub blocks: StandardArena<Block>,
    pub conts: StandardArena<Continuation>,
    /// Every variable name ever used in the function.
    names: HashSet<String>,
    counter: usize,
}

impl Function {
    pub fn new(name: impl Into<String>, inputs: Vec<Var>, outputs: Vec<Var>) -> Self {
        let mut blocks = StandardArena::new();
        let body = blocks.insert(Block::default());
        let names = inputs
            .iter()
            .chain(&outputs)
            .map(|v| v.name.clone())
            .collect();
        Self {
            name: name.into(),
            inputs,
            outputs,
            body,
            blocks,
            conts: StandardArena::new(),
            names,
            counter: 0,
        }
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    pub fn cont(&self, id: ContId) -> &Continuation {
        &self.conts[id]
    }

    pub fn cont_mut(&mut self, id: ContId) -> &mut Continuation {
        &mut self.conts[id]
    }

    pub fn is_argument(&self, var: &Var) -> bool {
        self.inputs.contains(var) || self.outputs.contains(var)
    }

    /// Marks a name as taken so fresh names never collide with it.
    pub fn reserve_name(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// A name unused in this function, derived from `base`.
    pub fn fresh_name(&mut self, base: &str) -> String {
        let stem = match base.rsplit_once(':') {
            Some((stem, suffix)) if !stem.is_empty() && suffix.parse::<u64>().is_ok() => stem,
            _ => base,
        };
        loop {
            self.counter += 1;
            let name = format!("{stem}:{}", self.counter);
            if self.names.insert(name.clone()) {
                return name;
            }
        }
    }

    /// A copy of `template` under a fresh name.
    pub fn fresh_var(&mut self, template: &Var) -> Var {
        let name = self.fresh_name(&template.name);
        template.with_name(name)
    }

    pub fn fresh_temp(&mut self, base: &str, ty: Type) -> Var {
        Var::temp(self.fresh_name(base), ty)
    }

    pub fn declare(&mut self, block: BlockId, var: Var) -> Result<(), IrError> {
        let target = &mut self.blocks[block];
        if target.declares(&var) {
            return Err(IrError::DuplicateDeclaration { name: var.name });
        }
        self.names.insert(var.name.clone());
        target.variables.push(var);
        Ok(())
    }

    /// Adds a continuation, with no children yet, at the end of `block`.
    pub fn add_continuation(&mut self, block: BlockId, kind: ContinuationKind) -> ContId {
        let id = self.conts.insert(Continuation::new(kind, block));
        self.blocks[block].continuations.push(id);
        id
    }

    /// Appends a new, empty child block to `cont`.
    pub fn add_child(&mut self, cont: ContId) -> BlockId {
        let id = self.blocks.insert(Block::new(BlockParent::Cont(cont)));
        self.conts[cont].children.push(id);
        id
    }

    /// Detaches the continuation from its block and drops its subtree.
    pub fn remove_continuation(&mut self, cont: ContId) {
        let parent = self.conts[cont].parent;
        self.blocks[parent].continuations.retain(|c| *c != cont);
        self.drop_cont(cont);
    }

    fn drop_cont(&mut self, cont: ContId) {
        if let Some(cont) = self.conts.remove(cont) {
            for child in cont.children {
                self.drop_block(child);
            }
        }
    }

    fn drop_block(&mut self, block: BlockId) {
        if let Some(block) = self.blocks.remove(block) {
            for cont in block.continuations {
                self.drop_cont(cont);
            }
        }
    }

    /// Blocks of the subtree rooted at `root`, parents before children.
    pub fn blocks_preorder(&self, root: BlockId) -> Vec<BlockId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(block) = stack.pop() {
            order.push(block);
            for cont in self.blocks[block].continuations.iter().rev() {
                stack.extend(self.conts[*cont].children.iter().rev());
            }
        }
        order
    }

    /// Continuations of the subtree rooted at `root`, parents before children.
    pub fn conts_preorder(&self, root: BlockId) -> Vec<ContId> {
        self.blocks_preorder(root)
            .into_iter()
            .flat_map(|b| self.blocks[b].continuations.iter().copied())
            .collect()
    }

    /// The continuation owning `block`, if it isn't the function body.
    pub fn parent_cont(&self, block: BlockId) -> Option<ContId> {
        match self.blocks[block].parent {
            BlockParent::Cont(cont) => Some(cont),
            BlockParent::Function => None,
        }
    }

    /// Every variable that may be in scope in `block`.
    pub fn visible_vars(&self, block: BlockId) -> HashSet<Var> {
        let mut vars: HashSet<Var> = self.inputs.iter().chain(&self.outputs).cloned().collect();
        let mut cursor = Some(block);
        while let Some(block) = cursor {
            vars.extend(self.blocks[block].variables.iter().cloned());
            cursor = self.parent_cont(block).map(|cont| {
                vars.extend(self.conts[cont].defined_vars());
                self.conts[cont].parent
            });
        }
        vars
    }

    /// Deep copies a block subtree under a new parent. Loop control inside the copy is
    /// relinked to the copied loops.
    pub fn clone_block(&mut self, source: BlockId, parent: BlockParent) -> BlockId {
        let mut copies = HashMap::new();
        let root = self.clone_subtree(source, parent, &mut copies);
        for block in self.blocks_preorder(root) {
            for inst in &mut self.blocks[block].instructions {
                if let Instruction::LoopContinue(LoopContinue {
                    loop_id: Some(id), ..
                })
                | Instruction::LoopBreak(LoopBreak {
                    loop_id: Some(id), ..
                }) = inst
                {
                    if let Some(copy) = copies.get(id) {
                        *id = *copy;
                    }
                }
            }
        }
        root
    }

    fn clone_subtree(
        &mut self,
        source: BlockId,
        parent: BlockParent,
        copies: &mut HashMap<ContId, ContId>,
    ) -> BlockId {
        let mut block = self.blocks[source].clone();
        block.parent = parent;
        let conts = std::mem::take(&mut block.continuations);
        let id = self.blocks.insert(block);

        for old in conts {
            let mut cont = self.conts[old].clone();
            cont.parent = id;
            let children = std::mem::take(&mut cont.children);
            let new = self.conts.insert(cont);
            copies.insert(old, new);
            self.blocks[id].continuations.push(new);
            for child in children {
                let child = self.clone_subtree(child, BlockParent::Cont(new), copies);
                self.conts[new].children.push(child);
            }
        }
        id
    }

    /// Applies a substitution to a block subtree.
    ///
    /// Declarations are never renamed, and a key stops applying below any block that
    /// re-declares it. With [`RenameMode::InputsOnly`] a key also stops at a continuation
    /// that defines it.
    pub fn rename_vars(&mut self, block: BlockId, renames: &Renames, mode: RenameMode) {
        if renames.is_empty() {
            return;
        }
        let scope = Arc::new(renames.clone());
        self.rename_in(block, &scope, mode);
    }

    fn rename_in(&mut self, block: BlockId, renames: &Arc<Renames>, mode: RenameMode) {
        let target = &mut self.blocks[block];
        for inst in &mut target.instructions {
            inst.rename(renames, mode);
        }
        for var in &mut target.cleanups {
            rename_var(var, renames);
        }

        for cont in target.continuations.clone() {
            self.conts[cont].rename(renames, mode);
            let redefined = match mode {
                RenameMode::InputsOnly => self.conts[cont].defined_vars(),
                RenameMode::All => vec![],
            };

            for child in self.conts[cont].children.clone() {
                let shadowed: Vec<Var> = redefined
                    .iter()
                    .chain(&self.blocks[child].variables)
                    .filter(|v| renames.contains_key(*v))
                    .cloned()
                    .collect();
                if shadowed.is_empty() {
                    self.rename_in(child, renames, mode);
                } else {
                    trace!(?shadowed, "withholding shadowed renames");
                    let mut scope = Renames::child(renames);
                    for var in &shadowed {
                        scope.remove(var);
                    }
                    self.rename_in(child, &Arc::new(scope), mode);
                }
            }
        }
    }

    /// Forgets removed variables in a block subtree.
    pub fn remove_vars(&mut self, block: BlockId, removed: &HashSet<Var>) -> Result<(), IrError> {
        for id in self.blocks_preorder(block) {
            let target = &mut self.blocks[id];
            target.variables.retain(|v| !removed.contains(v));
            target.cleanups.retain(|v| !removed.contains(v));
            for inst in &mut target.instructions {
                match inst {
                    Instruction::LoopContinue(cont) => {
                        cont.passed_vars.retain(|v| !removed.contains(v))
                    }
                    Instruction::LoopBreak(brk) => brk.close_vars.retain(|v| !removed.contains(v)),
                    _ => {}
                }
            }
            for cont in target.continuations.clone() {
                self.conts[cont].remove_vars(removed)?;
            }
        }
        Ok(())
    }

    pub fn is_noop_block(&self, block: BlockId) -> bool {
        let target = &self.blocks[block];
        target.instructions.is_empty()
            && target.cleanups.is_empty()
            && target.continuations.iter().all(|c| self.is_noop_cont(*c))
    }

    pub fn is_noop_cont(&self, cont: ContId) -> bool {
        self.conts[cont]
            .children
            .iter()
            .all(|b| self.is_noop_block(*b))
    }

    /// Replaces a continuation by the contents of one of its children.
    ///
    /// Each binding is declared in the parent block and initialized before the inlined
    /// instructions. Inlined declarations that would clash with a name already in scope are
    /// renamed first.
    pub fn inline_block(
        &mut self,
        cont: ContId,
        child: BlockId,
        bindings: Vec<(Var, Arg)>,
    ) -> Result<(), IrError> {
        let target = self.conts[cont].parent;
        let visible = self.visible_vars(target);
        let declared: Vec<Var> = bindings
            .iter()
            .map(|(var, _)| var.clone())
            .chain(self.blocks[child].variables.iter().cloned())
            .filter(|var| visible.contains(var))
            .collect();

        let mut renames = Renames::new();
        for var in declared {
            let fresh = self.fresh_var(&var);
            renames.insert(var, Arg::Var(fresh));
        }
        if !renames.is_empty() {
            trace!(function = %self.name, count = renames.to_map().len(), "renaming inlined declarations");
            for var in &mut self.blocks[child].variables {
                rename_var(var, &renames);
            }
            self.rename_vars(child, &renames, RenameMode::All);
        }

        for (mut var, value) in bindings {
            rename_var(&mut var, &renames);
            self.declare(target, var.clone())?;
            self.blocks[target]
                .instructions
                .push(Instruction::copy(&var, value));
        }

        self.blocks[target].continuations.retain(|c| *c != cont);
        self.splice_block(child, target)?;
        self.drop_cont(cont);
        Ok(())
    }

    /// Moves the whole contents of `from` to the end of `into`, leaving `from` empty.
    pub fn splice_block(&mut self, from: BlockId, into: BlockId) -> Result<(), IrError> {
        let moved = std::mem::take(&mut self.blocks[from]);
        self.blocks[from].parent = moved.parent;
        for var in moved.variables {
            self.declare(into, var)?;
        }
        for cont in &moved.continuations {
            self.conts[*cont].parent = into;
        }
        let target = &mut self.blocks[into];
        target.instructions.extend(moved.instructions);
        target.continuations.extend(moved.continuations);
        target.cleanups.extend(moved.cleanups);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConst {
    pub var: Var,
    pub value: Arg,
}

/// An external application. Its body is opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct AppFunction {
    pub name: String,
    pub inputs: Vec<Var>,
    pub outputs: Vec<Var>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    pub inputs: Vec<Type>,
    pub outputs: Vec<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinFunction {
    pub name: String,
    /// The runtime symbol implementing it.
    pub symbol: String,
    pub ty: FunctionType,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub globals: BTreeMap<String, GlobalConst>,
    pub apps: Vec<AppFunction>,
    pub builtins: Vec<BuiltinFunction>,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn add_global(&mut self, var: Var, value: Arg) -> Result<(), IrError> {
        match self.globals.entry(var.name.clone()) {
            Entry::Occupied(_) => Err(IrError::DuplicateGlobal { name: var.name }),
            Entry::Vacant(entry) => {
                entry.insert(GlobalConst { var, value });
                Ok(())
            }
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }
}
