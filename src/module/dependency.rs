//! 模块依赖解析
//!
//! 本模块维护以模块名为键的清单集合，以及由此构建的正向/反向邻接图，
//! 并提供依赖优先的加载顺序解析。
//!
//! # 主要组件
//!
//! - [`DependencyResolver`] - 清单集合 + 依赖图 + 解析算法
//! - [`ResolutionResult`] - 一次解析的输出：加载顺序、缺失项、环参与者
//!
//! # 解析算法
//!
//! 1. 目标为空时解析全部已知模块
//! 2. 沿正向边计算目标的可达闭包
//! 3. `missing` = 闭包内被非可选引用但未注册的名称
//! 4. `circular` = 参与环的节点（DFS + 递归栈，回边触发时标记回溯路径）
//! 5. 两者皆空时用 Kahn 算法产出依赖在前的 `load_order`
//!
//! # 示例
//!
//! ```rust
//! use helix_core::module::dependency::DependencyResolver;
//! use helix_core::module::manifest::{Dependency, ModuleManifest};
//!
//! let mut resolver = DependencyResolver::new();
//!
//! let mut app = ModuleManifest::new("app", "1.0.0", "libapp.so");
//! app.dependencies.push(Dependency::new("base", ">=1.0.0"));
//! resolver.add(app).unwrap();
//! resolver.add(ModuleManifest::new("base", "1.2.0", "libbase.so")).unwrap();
//!
//! let result = resolver.resolve(&["app".to_string()]);
//! assert!(result.success);
//! assert_eq!(result.load_order, vec!["base".to_string(), "app".to_string()]);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::module::manifest::ModuleManifest;
use crate::utils::{HelixError, Result};

/// 依赖解析结果
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    /// 依赖优先的加载顺序（含目标自身）
    pub load_order: Vec<String>,
    /// 被非可选引用但未注册的模块名（已排序）
    pub missing: Vec<String>,
    /// 参与循环依赖的模块名（已排序）
    pub circular: Vec<String>,
    /// `missing` 与 `circular` 皆空且排序成功
    pub success: bool,
}

/// 版本要求比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Tilde,
}

/// 依赖解析器
///
/// 以名称为键持有清单快照；每次增删后整体重建邻接图。
/// 图中的边是名称集合而非指针，数据层不存在回引环。
#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// 已注册的清单：name -> manifest
    modules: HashMap<String, ModuleManifest>,
    /// 正向边：模块 -> 它依赖的模块集合
    graph: HashMap<String, BTreeSet<String>>,
    /// 反向边：模块 -> 依赖它的模块集合
    reverse_graph: HashMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    /// 创建空的解析器
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个模块清单
    ///
    /// 重复的名称被拒绝；成功后重建依赖图。
    pub fn add(&mut self, manifest: ModuleManifest) -> Result<()> {
        if self.modules.contains_key(&manifest.name) {
            return Err(HelixError::AlreadyPresent(manifest.name));
        }

        self.modules.insert(manifest.name.clone(), manifest);
        self.build_graph();
        Ok(())
    }

    /// 移除一个模块清单（幂等）
    pub fn remove(&mut self, name: &str) {
        if self.modules.remove(name).is_some() {
            self.build_graph();
        }
    }

    /// 清空全部清单与图
    pub fn clear(&mut self) {
        self.modules.clear();
        self.graph.clear();
        self.reverse_graph.clear();
    }

    /// 是否已注册指定模块
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// 获取指定模块的清单
    pub fn manifest(&self, name: &str) -> Option<&ModuleManifest> {
        self.modules.get(name)
    }

    /// 已注册模块数量
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 模块的直接依赖（图中实际存在的边）
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.graph
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 依赖该模块的模块（含可选依赖者）
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.reverse_graph
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 非可选地依赖该模块的模块
    ///
    /// 反向图的边包含「可选且已安装」的依赖，卸载保护只关心非可选者，
    /// 因此这里按依赖方清单中的 optional 标记过滤。
    pub fn non_optional_dependents(&self, name: &str) -> Vec<String> {
        self.dependents(name)
            .into_iter()
            .filter(|dependent| {
                self.modules
                    .get(dependent)
                    .map(|m| {
                        m.dependencies
                            .iter()
                            .any(|d| d.name == name && !d.optional)
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    /// 解析目标集合的依赖
    ///
    /// # Arguments
    ///
    /// * `targets` - 目标模块名；为空表示解析全部已知模块
    ///
    /// # Returns
    ///
    /// [`ResolutionResult`]。`missing` 或 `circular` 非空时
    /// `success = false` 且 `load_order` 为空。
    pub fn resolve(&self, targets: &[String]) -> ResolutionResult {
        let mut result = ResolutionResult::default();

        let targets: Vec<String> = if targets.is_empty() {
            self.modules.keys().cloned().collect()
        } else {
            targets.to_vec()
        };

        // 沿正向边计算可达闭包；未注册的目标本身计入 missing
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut missing: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for target in &targets {
            if self.modules.contains_key(target) {
                if closure.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            } else {
                missing.insert(target.clone());
            }
        }

        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.graph.get(&current) {
                for dep in deps {
                    if self.modules.contains_key(dep) {
                        if closure.insert(dep.clone()) {
                            queue.push_back(dep.clone());
                        }
                    }
                }
            }
            // 图中的边只指向已注册模块；缺失项要看清单里的原始声明
            if let Some(manifest) = self.modules.get(&current) {
                for dep in &manifest.dependencies {
                    if !dep.optional && !self.modules.contains_key(&dep.name) {
                        missing.insert(dep.name.clone());
                    }
                }
            }
        }

        result.missing = missing.into_iter().collect();
        if !result.missing.is_empty() {
            return result;
        }

        // 环检测
        result.circular = self.detect_cycles(&closure);
        if !result.circular.is_empty() {
            return result;
        }

        // Kahn 拓扑排序：入度 = 闭包内的依赖数；
        // 弹出节点后沿反向边递减依赖者的入度。
        let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
        for module in &closure {
            let deg = self
                .graph
                .get(module)
                .map(|deps| deps.iter().filter(|d| closure.contains(*d)).count())
                .unwrap_or(0);
            in_degree.insert(module.clone(), deg);
        }

        let mut zero_queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(name, _)| name.clone())
            .collect();

        let mut load_order = Vec::with_capacity(closure.len());
        while let Some(current) = zero_queue.pop_front() {
            load_order.push(current.clone());

            if let Some(dependents) = self.reverse_graph.get(&current) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            zero_queue.push_back(dependent.clone());
                        }
                    }
                }
            }
        }

        // 环已排除，闭包必然被完整排序
        if load_order.len() != closure.len() {
            return result;
        }

        result.load_order = load_order;
        result.success = true;
        result
    }

    /// 判断可用版本是否满足版本要求
    ///
    /// 要求为空视为满足。比较只看 `MAJOR.MINOR.PATCH` 三元组，
    /// 预发布/构建后缀解析但不参与比较。
    /// `~X.Y.Z` 表示主次版本相同且 PATCH ≥ Z。
    ///
    /// # 示例
    ///
    /// ```rust
    /// use helix_core::module::dependency::DependencyResolver;
    ///
    /// assert!(DependencyResolver::version_satisfies("1.2.3", ">=1.2.3"));
    /// assert!(!DependencyResolver::version_satisfies("1.2.2", ">=1.2.3"));
    /// assert!(DependencyResolver::version_satisfies("1.2.5", "~1.2.3"));
    /// assert!(!DependencyResolver::version_satisfies("1.3.0", "~1.2.3"));
    /// ```
    pub fn version_satisfies(available: &str, requirement: &str) -> bool {
        if requirement.is_empty() {
            return true;
        }

        let (op, required) = match Self::parse_version_requirement(requirement) {
            Some(parsed) => parsed,
            None => return false,
        };

        let available = match Self::parse_version_components(available) {
            Some(v) => v,
            None => return false,
        };

        match op {
            VersionOp::Eq => available == required,
            VersionOp::Ge => available >= required,
            VersionOp::Gt => available > required,
            VersionOp::Le => available <= required,
            VersionOp::Lt => available < required,
            VersionOp::Tilde => {
                available.0 == required.0 && available.1 == required.1 && available.2 >= required.2
            }
        }
    }

    /// 判断版本要求格式是否合法（清单校验用）
    pub(crate) fn is_valid_version_requirement(requirement: &str) -> bool {
        Self::parse_version_requirement(requirement).is_some()
    }

    /// 解析版本要求：返回运算符与版本三元组
    ///
    /// 裸版本号等价于 `==`。格式不合法时返回 `None`。
    fn parse_version_requirement(requirement: &str) -> Option<(VersionOp, (u64, u64, u64))> {
        let requirement = requirement.trim();
        let (op, rest) = if let Some(rest) = requirement.strip_prefix(">=") {
            (VersionOp::Ge, rest)
        } else if let Some(rest) = requirement.strip_prefix("<=") {
            (VersionOp::Le, rest)
        } else if let Some(rest) = requirement.strip_prefix("==") {
            (VersionOp::Eq, rest)
        } else if let Some(rest) = requirement.strip_prefix('>') {
            (VersionOp::Gt, rest)
        } else if let Some(rest) = requirement.strip_prefix('<') {
            (VersionOp::Lt, rest)
        } else if let Some(rest) = requirement.strip_prefix('~') {
            (VersionOp::Tilde, rest)
        } else {
            (VersionOp::Eq, requirement)
        };

        Self::parse_version_components(rest.trim()).map(|v| (op, v))
    }

    /// 解析 `MAJOR.MINOR.PATCH` 三元组（后缀忽略）
    fn parse_version_components(version: &str) -> Option<(u64, u64, u64)> {
        let parsed = semver::Version::parse(version.trim()).ok()?;
        Some((parsed.major, parsed.minor, parsed.patch))
    }

    /// 重建正向/反向邻接图
    ///
    /// 可选依赖的目标缺席时不成边；一旦注册即成为普通边。
    fn build_graph(&mut self) {
        self.graph.clear();
        self.reverse_graph.clear();

        for (name, manifest) in &self.modules {
            self.graph.entry(name.clone()).or_default();

            for dep in &manifest.dependencies {
                if dep.optional && !self.modules.contains_key(&dep.name) {
                    continue;
                }

                self.graph
                    .entry(name.clone())
                    .or_default()
                    .insert(dep.name.clone());
                self.reverse_graph
                    .entry(dep.name.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }
    }

    /// 在闭包范围内检测环，返回所有环参与者（已排序）
    fn detect_cycles(&self, closure: &BTreeSet<String>) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut on_stack: HashSet<String> = HashSet::new();
        let mut path: Vec<String> = Vec::new();
        let mut cycle_nodes: BTreeSet<String> = BTreeSet::new();

        for node in closure {
            if !visited.contains(node) {
                self.cycle_dfs(node, &mut visited, &mut on_stack, &mut path, &mut cycle_nodes);
            }
        }

        cycle_nodes.into_iter().collect()
    }

    /// DFS 环检测：发现回边时标记从被重访节点到栈顶的整段路径
    fn cycle_dfs(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
        cycle_nodes: &mut BTreeSet<String>,
    ) {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = self.graph.get(node) {
            for dep in deps {
                if on_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap();
                    for member in &path[start..] {
                        cycle_nodes.insert(member.clone());
                    }
                } else if !visited.contains(dep) {
                    self.cycle_dfs(dep, visited, on_stack, path, cycle_nodes);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
    }
}
