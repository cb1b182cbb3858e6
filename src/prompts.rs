//! Prompt templates. Placeholders are written `{name}` and filled by
//! `render_template`; unknown placeholders are left untouched.

pub const FORMATTER_TEMPLATE: &str = "Please check if the text conforms to JSON format. \
If it does not, output the correct JSON format result or extract the part in JSON format; \
if it does, return the original text.\n\
Please return a valid JSON result, without any extra explanations or symbols.\n\
TEXT: {text}";

pub const WORKER_PLAN_TEMPLATE: &str = "{role_description}\n\n\
Task description:\n{task_description}\n\n\
Tools you can call through {tool_executor}:\n{tool_description}\n\n\
First decide which kind of task the following assignment is, then write a short, \
numbered plan for how you will complete it with the tools above. \
Reply with the plan only.\n\n\
Assignment:\n{user_input}";

pub const LEADER_PLAN_TEMPLATE: &str = "{role_description}\n\n\
Task description:\n{task_description}\n\n\
Members of your team:\n{team_description}\n\n\
Break the following task into ordered sub-tasks. Name the team member responsible \
for each sub-task and finish with the step in which you compare their results and \
conclude. Reply with the numbered plan only.\n\n\
Task:\n{user_input}";

pub const WORKER_CHAT_TEMPLATE: &str = "{role_description}\n\n\
Members of your team:\n{team_description}\n\n\
Tools you can call:\n{tool_description}\n\n\
Every reply MUST be a single JSON object and nothing else:\n\
{\"receiver\": \"<one of: {receivers}>\", \"content\": \"<your message>\"}\n\
To call a tool, set receiver to \"{tool_executor}\" and make content a JSON object: \
{\"tool name\": \"<tool>\", \"args\": {<arguments>}}.\n\
Report your findings to \"{leader}\" as soon as the assigned task is done.";

pub const LEADER_CHAT_TEMPLATE: &str = "{role_description}\n\n\
You are managing a conversation between the following workers:\n{team_description}\n\n\
Assign one sub-task to one worker at a time and wait for its result. \
Workers cannot see each other's messages, so pass along whatever they need.\n\n\
Every reply MUST be a single JSON object and nothing else:\n\
{\"receiver\": \"<one of: {receivers}>\", \"content\": \"<your message>\"}\n\
When you have reached a verdict, send it to \"{end}\" with content \
{\"conclusion\": \"support\" | \"refute\", \"reason\": \"<why>\"}.";

pub const DEFAULT_LEADER_ROLE: &str = "You are the team_leader of a research group. \
You own the task, split it into sub-tasks for your team and give the final answer.";

pub const DEFAULT_LEADER_TASK: &str = "Verify a claim about the knowledge graph and answer \
'support' if it is correct or 'refute' if it is not.";

pub const DEFAULT_KG_ROLE: &str = "You are the kg_agent of a research group. \
You answer questions by querying the knowledge graph (KG) and report the results.";

pub const DEFAULT_KG_TASK: &str = "Query node existence, node attributes or relations \
between nodes in the KG as the team_leader asks.";

pub const DEFAULT_VALIDATION_ROLE: &str = "You are the validation_agent of a research group. \
You verify information against external databases and publications.";

pub const DEFAULT_VALIDATION_TASK: &str = "Verify the statements the team_leader passes to you \
and answer with a 'support' or 'refute' attitude together with your evidence.";

pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_known_placeholders_only() {
        let out = render_template("{a} and {b} but not {c}", &[("a", "1"), ("b", "2")]);
        assert_eq!(out, "1 and 2 but not {c}");
    }
}
