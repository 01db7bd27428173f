pub const ANALYSIS_SYSTEM: &str = "You are an expert recruiter and resume reviewer. \
    You always answer with valid JSON matching the requested structure.";

pub const ANALYSIS_PROMPT_TEMPLATE: &str = r#"Analyse the following resume and give a complete assessment.

RESUME:
{cv_text}

Return JSON with EXACTLY this structure:
{
  "score": <integer between 0 and 100>,
  "strengths": [<3-5 strengths>],
  "weaknesses": [<3-5 weaknesses>],
  "missingSkills": [<important skills that are missing>],
  "improvements": [
    { "category": "<Format | Content | Skills | ...>", "suggestion": "<detailed suggestion>" }
  ],
  "extractedData": {
    "name": "<name if found>",
    "email": "<email if found>",
    "phone": "<phone if found>",
    "skills": [<skills>],
    "experience": [<professional experiences>],
    "education": [<education entries>]
  },
  "atsCompatible": <true | false>
}"#;

pub const OPTIMIZE_SYSTEM: &str = "You are an expert writer of professional resumes.";

pub const OPTIMIZE_PROMPT_TEMPLATE: &str = r#"Rewrite the resume below into an improved version optimised for applicant tracking systems.

ORIGINAL RESUME:
{cv_text}

ASSESSMENT:
- Current score: {score}/100
- Weaknesses: {weaknesses}
- Missing skills: {missing_skills}

INSTRUCTIONS:
1. Keep all true information from the original resume
2. Improve structure and formatting for ATS compatibility
3. Optimise keywords and skills
4. Make the resume more impactful and professional
5. Output simple, clean Markdown

{truthfulness}"#;
