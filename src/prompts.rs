use std::fmt::Write;

use crate::capability::ScriptRequest;
use crate::config::CommentaryStyle;

/// Spoken-duration target: a little under the video so the narration never
/// outruns the footage.
pub fn target_duration_secs(video_secs: f64) -> f64 {
    (video_secs * 0.8).max(video_secs - 2.0).min(video_secs)
}

pub fn system_prompt(style: CommentaryStyle) -> String {
    let base = "You are a skilled video commentator. Your commentary focuses on what is \
actually visible in the footage, references specific details, varies its emotional register \
with the content, and flows naturally when spoken aloud.";

    let style_block = match style {
        CommentaryStyle::Documentary => {
            "Write informative, well-researched commentary: formal but engaging language, \
context and background where it helps, an authoritative tone with educational value."
        }
        CommentaryStyle::Energetic => {
            "Write high-energy commentary: dynamic expressions, momentum and anticipation, \
emphasis on dramatic moments, genuine enthusiasm without being over-the-top."
        }
        CommentaryStyle::Analytical => {
            "Write insightful analysis: break down what is happening, identify patterns and \
connections, use precise language, stay objective while remaining engaging."
        }
        CommentaryStyle::Storyteller => {
            "Write narrative-driven commentary: build a story arc across the video, use \
descriptive evocative language, emphasize the human elements, keep the pacing natural."
        }
    };

    format!("{base}\n\n{style_block}")
}

/// The user prompt for the script call: scene timeline, pacing budget and
/// the JSON segment protocol the adapter parses.
pub fn script_prompt(request: &ScriptRequest) -> String {
    let language = request.config.language;
    let duration = request.duration_secs;
    let target = target_duration_secs(duration);
    let word_budget = (target / 60.0 * language.words_per_minute() as f64).round() as u32;

    let mut prompt = String::new();
    if let Some(title) = request.title.as_deref() {
        let _ = writeln!(prompt, "VIDEO TITLE: {title}\n");
    }
    let _ = writeln!(
        prompt,
        "SCENE TIMELINE (timestamped descriptions of sampled frames):"
    );
    for (timestamp, description) in &request.scenes {
        let _ = writeln!(prompt, "- at {timestamp:.1}s: {description}");
    }
    let _ = writeln!(
        prompt,
        "\nWrite {language} commentary for this {duration:.1} second video.\n\
\n\
CONSTRAINTS:\n\
- Total spoken time at most {target:.1} seconds, about {word_budget} words in total.\n\
- Anchor each line to the scene timestamps above; do not invent timings.\n\
- Lines must be chronologically ordered, non-overlapping, and inside 0..{duration:.1} seconds.\n\
- Leave a little air between lines; do not wall-to-wall narrate.\n\
\n\
Respond with ONLY a JSON array, one object per commentary line:\n\
[{{\"start\": <seconds>, \"end\": <seconds>, \"text\": \"<line>\"}}]",
        language = language.name(),
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, Language, ScriptModel};

    #[test]
    fn target_stays_under_video_duration() {
        assert_eq!(target_duration_secs(100.0), 98.0);
        assert!((target_duration_secs(5.0) - 4.0).abs() < 1e-9);
        assert!(target_duration_secs(1.0) <= 1.0);
    }

    #[test]
    fn prompt_carries_timeline_and_budget() {
        let request = ScriptRequest {
            scenes: vec![(2.5, "a dog runs".into()), (7.5, "the dog jumps".into())],
            duration_secs: 10.0,
            title: Some("Dog day".into()),
            config: JobConfig {
                style: CommentaryStyle::Energetic,
                model: ScriptModel::Gpt4oMini,
                language: Language::English,
            },
        };
        let prompt = script_prompt(&request);
        assert!(prompt.contains("Dog day"));
        assert!(prompt.contains("at 2.5s: a dog runs"));
        assert!(prompt.contains("English"));
        assert!(prompt.contains("JSON array"));
        // 8s target at 150 wpm.
        assert!(prompt.contains("about 20 words"), "{prompt}");
    }
}
