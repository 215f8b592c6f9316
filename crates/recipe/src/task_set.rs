//! Expansion of a recipe into a validated task graph.

use crate::error::{RecipeError, Result};
use crate::evaluator::{self, Coercion, Env, Range};
use crate::task::Task;
use factory_core::{Param, Recipe, Step};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The tasks generated from one recipe and one set of arguments.
#[derive(Debug, Clone)]
pub struct TaskSet {
    id: String,
    params: Vec<Param>,
    steps: Vec<Step>,
    user_args: Env,
    tasks: Vec<Task>,
    task_map: HashMap<String, usize>,
}

impl TaskSet {
    /// Create an empty set for a recipe.
    pub fn new(recipe: &Recipe) -> Self {
        Self {
            id: recipe.id.clone(),
            params: recipe.params.clone(),
            steps: recipe.steps.clone(),
            user_args: Env::new(),
            tasks: Vec::new(),
            task_map: HashMap::new(),
        }
    }

    /// Recipe id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared parameters.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Supply submission arguments. Declared parameters with a default fill
    /// in anything the caller left out.
    pub fn set_user_args(&mut self, mut args: Env) {
        for param in &self.params {
            if let Some(default) = &param.default {
                args.entry(param.id.clone()).or_insert_with(|| default.clone());
            }
        }
        self.user_args = args;
    }

    /// Arguments in effect.
    pub fn user_args(&self) -> &Env {
        &self.user_args
    }

    /// Expand every step into tasks and link dependencies.
    ///
    /// Previous results are discarded first, so calling this twice yields
    /// the same set.
    pub fn create_tasks(&mut self) -> Result<()> {
        self.tasks.clear();
        self.task_map.clear();

        let mut expansion = Expansion::default();
        for (step_index, step) in self.steps.iter().enumerate() {
            match &step.multiplicity {
                Some(multiplicity) => {
                    if multiplicity.is_empty() {
                        return Err(RecipeError::EmptyMultiplicity);
                    }
                    let mut ranges = Vec::with_capacity(multiplicity.len());
                    for (name, expr) in multiplicity {
                        let value = evaluator::eval(expr, &self.user_args, Some(Coercion::Range))?;
                        ranges.push((name.as_str(), Range::from_value(&value)?));
                    }
                    expansion.iterate(&ranges, step, step_index, &self.user_args)?;
                }
                None => expansion.create_task(step, step_index, &self.user_args)?,
            }
        }

        expansion.link()?;
        debug!(recipe = %self.id, tasks = expansion.tasks.len(), "Expanded recipe");
        self.tasks = expansion.tasks;
        self.task_map = expansion.task_map;
        Ok(())
    }

    /// Re-check every dependency without changing anything.
    pub fn validate(&self) -> Result<()> {
        for task in &self.tasks {
            for dep in &task.depends {
                check_dependency(&self.tasks, &self.task_map, task, dep)?;
            }
        }
        Ok(())
    }

    /// Tasks in creation order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up a task by id.
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.task_map.get(task_id).map(|&i| &self.tasks[i])
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks were generated.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Take the tasks, leaving the set empty.
    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }
}

/// Compile a recipe with the given arguments.
pub fn compile(recipe: &Recipe, args: Env) -> Result<TaskSet> {
    let mut set = TaskSet::new(recipe);
    set.set_user_args(args);
    set.create_tasks()?;
    Ok(set)
}

#[derive(Default)]
struct Expansion {
    tasks: Vec<Task>,
    task_map: HashMap<String, usize>,
}

impl Expansion {
    /// Cartesian product of the ranges, outermost first.
    fn iterate(
        &mut self,
        ranges: &[(&str, Range)],
        step: &Step,
        step_index: usize,
        env: &Env,
    ) -> Result<()> {
        let Some(((name, range), rest)) = ranges.split_first() else {
            return self.create_task(step, step_index, env);
        };
        let mut scope = env.clone();
        for value in range.values() {
            scope.insert(name.to_string(), value);
            self.iterate(rest, step, step_index, &scope)?;
        }
        Ok(())
    }

    fn create_task(&mut self, step: &Step, step_index: usize, env: &Env) -> Result<()> {
        let task_id = evaluator::eval_string(&step.id, env)?;
        let title = match &step.title {
            Some(title) => evaluator::eval_string(title, env)?,
            None => task_id.clone(),
        };
        if self.task_map.contains_key(&task_id) {
            return Err(RecipeError::DuplicateTask(task_id));
        }

        let mut task = Task::new(task_id, title);
        task.step_index = step_index;
        task.index = self.tasks.len();

        if let Some(depends) = &step.depends {
            task.depends = unique(evaluator::eval_strings(depends, env)?);
        }
        task.image = optional_string(&step.image, env)?;
        task.tool = optional_string(&step.tool, env)?;
        task.workdir = optional_string(&step.workdir, env)?;
        if let Some(args) = &step.args {
            task.args = evaluator::eval_strings(args, env)?;
        }
        if let Some(vars) = &step.env {
            for (name, expr) in vars {
                task.env.insert(name.clone(), evaluator::eval_string(expr, env)?);
            }
        }
        if let Some(inputs) = &step.inputs {
            task.inputs = unique(evaluator::eval_strings(inputs, env)?);
        }
        if let Some(outputs) = &step.outputs {
            task.outputs = unique(evaluator::eval_strings(outputs, env)?);
        }
        if let Some(weight) = &step.weight {
            if let Value::Number(n) = evaluator::eval(weight, env, Some(Coercion::Number))? {
                task.weight = n.as_f64().unwrap_or(1.0);
            }
        }

        self.task_map.insert(task.task_id.clone(), task.index);
        self.tasks.push(task);
        Ok(())
    }

    fn link(&mut self) -> Result<()> {
        let mut edges = Vec::new();
        for task in &self.tasks {
            for dep in &task.depends {
                let prior = check_dependency(&self.tasks, &self.task_map, task, dep)?;
                edges.push((prior, task.task_id.clone()));
            }
        }
        for (prior, dependent) in edges {
            self.tasks[prior].dependents.push(dependent);
        }
        Ok(())
    }
}

/// Returns the index of the task named by `dep`.
fn check_dependency(
    tasks: &[Task],
    task_map: &HashMap<String, usize>,
    task: &Task,
    dep: &str,
) -> Result<usize> {
    let Some(&prior) = task_map.get(dep) else {
        return Err(RecipeError::MissingDependency {
            task: task.task_id.clone(),
            depends: dep.to_string(),
        });
    };
    let step = tasks[prior].step_index;
    if step > task.step_index {
        return Err(RecipeError::ForwardDependency {
            task: task.task_id.clone(),
            depends: dep.to_string(),
        });
    }
    if step == task.step_index {
        return Err(RecipeError::SameStepDependency {
            task: task.task_id.clone(),
            depends: dep.to_string(),
        });
    }
    Ok(prior)
}

fn optional_string(expr: &Option<Value>, env: &Env) -> Result<Option<String>> {
    match expr {
        Some(expr) => Ok(Some(evaluator::eval_string(expr, env)?)),
        None => Ok(None),
    }
}

fn unique(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recipe() -> Recipe {
        serde_json::from_value(json!({
            "id": "test",
            "title": "test-recipe",
            "type": "Job",
            "params": [],
            "steps": [{
                "id": "render.{{i}}.{{j}}",
                "title": "Render Frame {{i}} Tile {{j}}",
                "multiplicity": { "i": "{{frames}}", "j": "{{tiles}}" },
                "args": ["--frame", "{{i}}"],
                "env": { "TILE": "{{j}}" },
                "outputs": ["frame_{{i}}.jpg"]
            }, {
                "id": "movie",
                "title": "Create Movie",
                "depends": [{ "$foreach": ["frame", "{{frames}}", "render.{{frame}}.1"] }],
                "inputs": [{ "$foreach": ["frame", "{{frames}}", "frame_{{frame}}.jpg"] }]
            }]
        }))
        .unwrap()
    }

    fn args() -> Env {
        match json!({ "frames": [1, 3], "tiles": [1, 10, 5] }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn compiled(recipe: &Recipe) -> Result<TaskSet> {
        compile(recipe, args())
    }

    #[test]
    fn test_construction() {
        let ts = TaskSet::new(&recipe());
        assert_eq!(ts.id(), "test");
        assert!(ts.params().is_empty());
        assert!(ts.is_empty());
    }

    #[test]
    fn test_multiplicity_expansion() {
        let ts = compiled(&recipe()).unwrap();
        assert_eq!(ts.len(), 7);
        for id in ["render.1.1", "render.1.6", "render.2.1", "render.2.6", "render.3.1", "render.3.6", "movie"] {
            assert!(ts.get(id).is_some(), "missing {}", id);
        }
        let order: Vec<_> = ts.tasks().iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order[..2], ["render.1.1", "render.1.6"]);
        assert_eq!(ts.tasks().iter().map(|t| t.index).collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_ids_and_titles() {
        let ts = compiled(&recipe()).unwrap();
        assert_eq!(ts.get("render.1.1").unwrap().title, "Render Frame 1 Tile 1");
        assert_eq!(ts.get("movie").unwrap().title, "Create Movie");
        assert_eq!(ts.get("movie").unwrap().step_index, 1);
    }

    #[test]
    fn test_dependencies() {
        let ts = compiled(&recipe()).unwrap();
        let render = ts.get("render.1.1").unwrap();
        assert!(render.depends.is_empty());
        assert_eq!(render.dependents, vec!["movie"]);
        assert!(ts.get("render.1.6").unwrap().dependents.is_empty());

        let movie = ts.get("movie").unwrap();
        assert_eq!(movie.depends, vec!["render.1.1", "render.2.1", "render.3.1"]);
        assert!(movie.dependents.is_empty());
    }

    #[test]
    fn test_args_env_and_files() {
        let ts = compiled(&recipe()).unwrap();
        let render = ts.get("render.2.6").unwrap();
        assert_eq!(render.args, vec!["--frame", "2"]);
        assert_eq!(render.env.get("TILE").map(String::as_str), Some("6"));
        assert_eq!(render.outputs, vec!["frame_2.jpg"]);
        assert!(render.inputs.is_empty());

        let movie = ts.get("movie").unwrap();
        assert!(movie.args.is_empty());
        assert!(movie.env.is_empty());
        assert_eq!(movie.inputs, vec!["frame_1.jpg", "frame_2.jpg", "frame_3.jpg"]);
        assert!(movie.outputs.is_empty());
        assert_eq!(movie.weight, 1.0);
    }

    #[test]
    fn test_lists_are_deduplicated() {
        let mut r = recipe();
        r.steps[1].inputs = Some(json!(["a.jpg", "b.jpg", "a.jpg"]));
        r.steps[1].depends = Some(json!(["render.1.1", "render.1.1"]));
        let ts = compiled(&r).unwrap();
        let movie = ts.get("movie").unwrap();
        assert_eq!(movie.inputs, vec!["a.jpg", "b.jpg"]);
        assert_eq!(movie.depends, vec!["render.1.1"]);
        assert_eq!(ts.get("render.1.1").unwrap().dependents, vec!["movie"]);
    }

    #[test]
    fn test_empty_multiplicity() {
        let mut r = recipe();
        r.steps[0].multiplicity = Some(serde_json::Map::new());
        assert_eq!(compiled(&r).unwrap_err().to_string(), "Empty multiplicity specification");
    }

    #[test]
    fn test_unique_task_ids() {
        let mut r = recipe();
        r.steps[0].id = json!("x");
        assert_eq!(compiled(&r).unwrap_err().to_string(), "Task id \"x\" is not unique.");
    }

    #[test]
    fn test_missing_dependency() {
        let mut r = recipe();
        r.steps[0].depends = Some(json!(["x"]));
        assert_eq!(
            compiled(&r).unwrap_err().to_string(),
            "Task \"render.1.1\" depends on non-existent task \"x\"."
        );
    }

    #[test]
    fn test_same_step_dependency() {
        let mut r = recipe();
        r.steps[0].depends = Some(json!(["render.2.1"]));
        assert_eq!(
            compiled(&r).unwrap_err().to_string(),
            "Task \"render.1.1\" cannot depend on task \"render.2.1\" which is in the same step."
        );
    }

    #[test]
    fn test_forward_dependency() {
        let mut r = recipe();
        r.steps[0].depends = Some(json!(["movie"]));
        assert_eq!(
            compiled(&r).unwrap_err().to_string(),
            "Task \"render.1.1\" cannot depend on subsequent task \"movie\"."
        );
    }

    #[test]
    fn test_validate_and_recompile_are_stable() {
        let mut ts = compiled(&recipe()).unwrap();
        ts.validate().unwrap();
        ts.validate().unwrap();
        let first = ts.tasks().to_vec();
        ts.create_tasks().unwrap();
        assert_eq!(ts.tasks(), first.as_slice());
    }

    #[test]
    fn test_param_defaults_fill_missing_args() {
        let r: Recipe = serde_json::from_value(json!({
            "id": "single",
            "params": [
                { "id": "quality", "type": "integer", "default": 80 },
                { "id": "name", "type": "text", "default": "out" }
            ],
            "steps": [{ "id": "encode", "args": ["-q", "{{quality}}", "{{name}}.mp4"] }]
        }))
        .unwrap();
        let mut given = Env::new();
        given.insert("name".into(), json!("final"));
        let ts = compile(&r, given).unwrap();
        let task = ts.get("encode").unwrap();
        assert_eq!(task.args, vec!["-q", "80", "final.mp4"]);
        // Missing title falls back to the id
        assert_eq!(task.title, "encode");
    }

    #[test]
    fn test_weight_expression() {
        let mut r = recipe();
        r.steps[0].weight = Some(json!("{{i}}"));
        let ts = compiled(&r).unwrap();
        assert_eq!(ts.get("render.3.1").unwrap().weight, 3.0);
    }
}
